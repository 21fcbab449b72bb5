use std::fmt;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by every component.
///
/// Variants carry rendered strings rather than sources so that errors can be
/// cloned onto channels (the syncer's error lane, the bridge's tool results).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("failed to list pods: {0}")]
    PodList(String),
    #[error("pod watch failed: {0}")]
    PodWatch(String),
    #[error("failed to update data plane: {0}")]
    DataPlaneUpdate(String),
    #[error("cluster {server} is reached through an HTTP proxy; streaming watches will not work")]
    ClusterBehindProxy { server: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("health check of {url} failed after {attempts} attempts: {last}")]
    HealthCheckTimeout { url: String, attempts: u32, last: String },
    #[error("{target} was not ready within {secs}s")]
    ReadinessDeadline { target: String, secs: u64 },
    #[error("platform pod failed: {0}")]
    PlatformFailure(String),
    #[error("local port {0} is already in use")]
    PortInUse(u16),
    #[error("could not expose service {service}: {reason}")]
    IngressUnavailable { service: String, reason: String },
    #[error("no usable kubernetes credentials: {0}")]
    AuthMissing(String),
    #[error("kubernetes api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Flat discriminant of [`Error`] used for routing decisions and rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PodListError,
    PodWatchError,
    DataPlaneUpdateError,
    ClusterBehindProxy,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    HealthCheckTimeout,
    ReadinessDeadline,
    PlatformFailure,
    PortInUse,
    IngressUnavailable,
    AuthMissing,
    ApiError,
    TransportError,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Component names as they appear in user-facing failure lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Cluster,
    Watch,
    Readiness,
    Ingress,
    Syncer,
    Deploy,
    Bridge,
    Config,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Cluster => "cluster",
            Component::Watch => "watch",
            Component::Readiness => "readiness",
            Component::Ingress => "ingress",
            Component::Syncer => "syncer",
            Component::Deploy => "deploy",
            Component::Bridge => "bridge",
            Component::Config => "config",
        };
        f.write_str(s)
    }
}

const BEHIND_PROXY_HINT: &str = "tapline needs direct access to the Kubernetes API server. \
If a tool such as Lens rewrote your kubeconfig to go through a local proxy, \
run again with --kubeconfig pointing at the original file (usually $HOME/.kube/config).";

const PERMISSION_HINT: &str = "ask a cluster administrator to grant the missing permission; \
`tapline check` lists every permission the platform needs.";

const AUTH_HINT: &str = "pass --kubeconfig <path>, set KUBECONFIG, or create $HOME/.kube/config \
(for example with your cloud provider's `get-credentials` command).";

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PodList(_) => ErrorKind::PodListError,
            Error::PodWatch(_) => ErrorKind::PodWatchError,
            Error::DataPlaneUpdate(_) => ErrorKind::DataPlaneUpdateError,
            Error::ClusterBehindProxy { .. } => ErrorKind::ClusterBehindProxy,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::HealthCheckTimeout { .. } => ErrorKind::HealthCheckTimeout,
            Error::ReadinessDeadline { .. } => ErrorKind::ReadinessDeadline,
            Error::PlatformFailure(_) => ErrorKind::PlatformFailure,
            Error::PortInUse(_) => ErrorKind::PortInUse,
            Error::IngressUnavailable { .. } => ErrorKind::IngressUnavailable,
            Error::AuthMissing(_) => ErrorKind::AuthMissing,
            Error::Api { .. } => ErrorKind::ApiError,
            Error::Transport(_) => ErrorKind::TransportError,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Component that owns this failure kind.
    pub fn component(&self) -> Component {
        match self {
            Error::PodList(_) | Error::PodWatch(_) | Error::DataPlaneUpdate(_) => Component::Syncer,
            Error::ClusterBehindProxy { .. }
            | Error::PermissionDenied(_)
            | Error::NotFound(_)
            | Error::AlreadyExists(_)
            | Error::AuthMissing(_)
            | Error::Api { .. } => Component::Cluster,
            Error::HealthCheckTimeout { .. } | Error::PortInUse(_) | Error::IngressUnavailable { .. } => Component::Ingress,
            Error::ReadinessDeadline { .. } | Error::PlatformFailure(_) | Error::Cancelled => Component::Deploy,
            Error::Transport(_) => Component::Bridge,
        }
    }

    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::ClusterBehindProxy { .. } => Some(BEHIND_PROXY_HINT),
            Error::PermissionDenied(_) => Some(PERMISSION_HINT),
            Error::AuthMissing(_) => Some(AUTH_HINT),
            _ => None,
        }
    }

    /// Errors the teardown path swallows: the resource is already gone, or it
    /// belongs to the platform and the caller may not touch it.
    pub fn is_teardown_benign(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::PermissionDenied(_))
    }

    /// Failures that end the process with exit code 1.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ClusterBehindProxy
                | ErrorKind::AuthMissing
                | ErrorKind::ReadinessDeadline
                | ErrorKind::PlatformFailure
                | ErrorKind::PermissionDenied
                | ErrorKind::IngressUnavailable
        )
    }

    /// Single-line rendering used by the CLI: `error[component/Kind]: message`.
    pub fn render_line(&self) -> String {
        format!("error[{}/{}]: {}", self.component(), self.kind(), self)
    }
}
