//! Cluster access and watch wiring.
//!
//! [`Cluster`] wraps a kube client built from the operator's kubeconfig and
//! exposes the handful of typed calls the rest of the workspace needs. The
//! [`watch`] module multiplexes per-namespace watches into one filtered
//! channel with automatic resubscription.

#![forbid(unsafe_code)]

mod cluster;
mod forward;
pub mod kubeconfig;
pub mod watch;

pub use cluster::{map_kube_error, meets_min_version, parse_version, Cluster, NamespacedResource, MIN_KUBE_VERSION};
pub use forward::{bind_local, ExecStatus, ExecStreams, PortForwardHandle};
pub use kubeconfig::ClusterOptions;
pub use watch::{EventFilter, Multiplexer, WatchChannels, WatchEvent, WatchSource, WatchedObject};

/// Re-exported so downstream crates name Kubernetes types without a direct
/// `k8s-openapi` dependency.
pub use k8s_openapi;
