use std::fmt;

use tapline_core::names::{PlatformNames, SERVICE_PORT};

/// Which path currently carries a session's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressMode {
    ReverseProxy,
    PortForward,
}

impl fmt::Display for IngressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressMode::ReverseProxy => f.write_str("proxy"),
            IngressMode::PortForward => f.write_str("port-forward"),
        }
    }
}

/// An in-cluster service and where to expose it locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub namespace: String,
    pub service: String,
    pub remote_port: u16,
    pub host: String,
    pub local_port: u16,
    /// Probed after each listener starts. `""` means `/`.
    pub health_path: String,
}

impl ServiceTarget {
    pub fn new(namespace: impl Into<String>, service: impl Into<String>, host: impl Into<String>, local_port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
            remote_port: SERVICE_PORT,
            host: host.into(),
            local_port,
            health_path: String::new(),
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Service-proxy path on the API server.
    pub fn proxy_prefix(&self) -> String {
        format!("/api/v1/namespaces/{}/services/{}:{}/proxy", self.namespace, self.service, self.remote_port)
    }

    /// Label selector for the pods behind the service.
    pub fn pod_selector(&self) -> String {
        PlatformNames::service_selector(&self.service)
    }

    pub fn base_url(&self) -> String {
        base_url(&self.host, self.local_port)
    }

    pub fn health_url(&self) -> String {
        health_url(&self.base_url(), &self.health_path)
    }
}

pub(crate) fn base_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

pub(crate) fn health_url(base: &str, path: &str) -> String {
    match path {
        "" => format!("{base}/"),
        p if p.starts_with('/') => format!("{base}{p}"),
        p => format!("{base}/{p}"),
    }
}

/// Public view of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub service: String,
    pub local_port: u16,
    pub mode: IngressMode,
    pub base_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_service_proxy_scheme() {
        let t = ServiceTarget::new("tapline", "tapline-front", "127.0.0.1", 8899);
        assert_eq!(t.proxy_prefix(), "/api/v1/namespaces/tapline/services/tapline-front:80/proxy");
        assert_eq!(t.base_url(), "http://127.0.0.1:8899");
        assert_eq!(t.health_url(), "http://127.0.0.1:8899/");
        assert_eq!(t.clone().with_health_path("/echo").health_url(), "http://127.0.0.1:8899/echo");
        assert_eq!(t.with_health_path("echo").health_url(), "http://127.0.0.1:8899/echo");
    }
}
