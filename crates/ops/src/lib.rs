//! Local ingress for the platform's in-cluster services.
//!
//! [`Ingress::expose`] first serves a reverse proxy that rewrites local paths
//! onto the API server's service-proxy URL. When that proxy fails its health
//! check the listener is shut down once and the same port is rebound to a
//! port-forward tunnel. Either way the caller gets back a base URL.

#![forbid(unsafe_code)]

mod backend;
mod ingress;
mod probe;
pub mod proxy;
mod target;

pub use backend::{IngressBackend, KubeBackend, ServingTask};
pub use ingress::Ingress;
pub use probe::probe;
pub use target::{IngressMode, ServiceTarget, SessionInfo};
