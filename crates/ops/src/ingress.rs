use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tapline_core::{CancellationToken, Error, RetryPolicy};
use tapline_kubehub::bind_local;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{IngressBackend, ServingTask};
use crate::probe::probe;
use crate::target::{base_url, health_url, IngressMode, ServiceTarget, SessionInfo};

struct Session {
    info: SessionInfo,
    serving: ServingTask,
}

/// Owns every local listener the process exposes, at most one per service.
pub struct Ingress {
    backend: Arc<dyn IngressBackend>,
    sessions: Mutex<HashMap<String, Session>>,
    policy: RetryPolicy,
    port_forward_host: Option<String>,
    cancel: CancellationToken,
}

impl Ingress {
    pub fn new(backend: Arc<dyn IngressBackend>, cancel: &CancellationToken) -> Self {
        Self {
            backend,
            sessions: Mutex::new(HashMap::new()),
            policy: RetryPolicy::default(),
            port_forward_host: None,
            cancel: cancel.child_token(),
        }
    }

    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bind host for the port-forward fallback; defaults to the target host.
    pub fn with_port_forward_host(mut self, host: Option<String>) -> Self {
        self.port_forward_host = host.filter(|h| !h.is_empty());
        self
    }

    /// Expose `target`, preferring the reverse proxy and falling back to a
    /// port-forward when the proxy does not pass its health check. The
    /// registry lock is held only to look up and record sessions.
    pub async fn expose(&self, target: ServiceTarget) -> Result<SessionInfo, Error> {
        if let Some(info) = self.live(&target.service).await {
            return Ok(info);
        }
        let (info, serving) = self.establish(target).await?;
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&info.service).filter(|s| !s.serving.is_finished()).map(|s| s.info.clone()) {
            drop(sessions);
            debug!(service = %info.service, "exposed concurrently; keeping the earlier session");
            serving.shutdown().await;
            return Ok(existing);
        }
        sessions.insert(info.service.clone(), Session { info: info.clone(), serving });
        Ok(info)
    }

    async fn live(&self, service: &str) -> Option<SessionInfo> {
        let mut sessions = self.sessions.lock().await;
        let live = sessions.get(service)?;
        if !live.serving.is_finished() {
            return Some(live.info.clone());
        }
        warn!(service = %service, "previous ingress session ended; replacing");
        sessions.remove(service);
        None
    }

    async fn establish(&self, target: ServiceTarget) -> Result<(SessionInfo, ServingTask), Error> {
        let listener = bind_local(&target.host, target.local_port).await?;
        let port = listener.local_addr().map_err(|e| Error::Transport(e.to_string()))?.port();
        let target = ServiceTarget { local_port: port, ..target };

        let proxy = self.backend.serve_proxy(&target, listener, &self.cancel).await?;
        match probe(&target.health_url(), &self.policy, &self.cancel).await {
            Ok(()) => return Ok((self.announce(&target, &target.host, IngressMode::ReverseProxy), proxy)),
            Err(Error::Cancelled) => {
                proxy.shutdown().await;
                return Err(Error::Cancelled);
            }
            Err(e) => {
                warn!(service = %target.service, error = %e, "reverse proxy unhealthy; falling back to port-forward");
                proxy.shutdown().await;
                counter!("tapline_ingress_fallbacks_total").increment(1);
            }
        }

        let pf_host = self.port_forward_host.clone().unwrap_or_else(|| target.host.clone());
        let listener = bind_local(&pf_host, port).await?;
        let forward = self
            .backend
            .serve_port_forward(&target, listener, &self.cancel)
            .await
            .map_err(|e| unavailable(&target, e))?;
        match probe(&health_url(&base_url(&pf_host, port), &target.health_path), &self.policy, &self.cancel).await {
            Ok(()) => Ok((self.announce(&target, &pf_host, IngressMode::PortForward), forward)),
            Err(e) => {
                forward.shutdown().await;
                Err(match e {
                    Error::Cancelled => Error::Cancelled,
                    other => unavailable(&target, other),
                })
            }
        }
    }

    fn announce(&self, target: &ServiceTarget, host: &str, mode: IngressMode) -> SessionInfo {
        let info = SessionInfo {
            service: target.service.clone(),
            local_port: target.local_port,
            mode,
            base_url: base_url(host, target.local_port),
        };
        info!(service = %info.service, mode = %mode, url = %info.base_url, "service exposed");
        info
    }

    pub async fn session(&self, service: &str) -> Option<SessionInfo> {
        self.sessions.lock().await.get(service).map(|s| s.info.clone())
    }

    pub async fn stop(&self, service: &str) -> bool {
        let removed = self.sessions.lock().await.remove(service);
        match removed {
            Some(s) => {
                s.serving.shutdown().await;
                info!(service = %service, "ingress stopped");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for s in drained {
            s.serving.shutdown().await;
            info!(service = %s.info.service, "ingress stopped");
        }
    }
}

fn unavailable(target: &ServiceTarget, e: Error) -> Error {
    match e {
        Error::PortInUse(_) | Error::Cancelled => e,
        other => Error::IngressUnavailable { service: target.service.clone(), reason: other.to_string() },
    }
}
