//! Deploy lifecycle for tapline.
//!
//! [`Controller::run`] drives `start`: it resolves the target namespaces,
//! previews matching pods, installs the platform chart and then follows the
//! hub and front pods until both run. The hub is exposed as soon as it is up
//! and feeds the target syncer; the front is exposed exactly once, when both
//! pods are ready. Cancellation tears everything down in order.
//!
//! The free functions in [`platform`] serve the other verbs and the stdio
//! bridge's local tools.

#![forbid(unsafe_code)]

pub mod check;
mod controller;
pub mod installer;
mod namespaces;
mod options;
pub mod platform;
mod preview;

pub use controller::{classify_pod_event, failure_event, Controller, PodTransition, RunOutcome};
pub use installer::{HelmInstaller, InstallRequest, Installer, UninstallOutcome};
pub use namespaces::{resolve_namespaces, targets_all};
pub use options::{
    readiness_deadline_from_env, Collaborators, DeployOptions, IngressOptions, ReleaseOptions, DEFAULT_FRONT_PORT, DEFAULT_HUB_PORT,
    DEFAULT_PROXY_HOST, DEFAULT_READINESS_DEADLINE, HUB_TIMEOUT_ENV,
};
pub use platform::{expose_service, platform_status, stop_platform, wait_for_hub, HubPoll, PlatformProbe, PlatformService, PlatformStatus};
pub use preview::{matching_pods, no_pods_suggestion, preview_lines};
