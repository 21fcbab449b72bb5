use std::collections::BTreeMap;

/// Program name stamped on labels and shown in user-facing text.
pub const PROGRAM: &str = "tapline";

/// Namespace sentinel meaning "every namespace".
pub const ALL_NAMESPACES: &str = "";

pub const LABEL_MANAGED_BY: &str = "app.managed-by";
pub const LABEL_CREATED_BY: &str = "app.created-by";
pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";

/// In-cluster service port both platform services listen on.
pub const SERVICE_PORT: u16 = 80;

/// Names of the platform's own resources inside its self-namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformNames {
    pub self_namespace: String,
    pub hub_pod: String,
    pub front_pod: String,
    pub hub_service: String,
    pub front_service: String,
    pub worker_daemonset: String,
}

impl PlatformNames {
    pub fn new(self_namespace: impl Into<String>) -> Self {
        Self {
            self_namespace: self_namespace.into(),
            hub_pod: format!("{PROGRAM}-hub"),
            front_pod: format!("{PROGRAM}-front"),
            hub_service: format!("{PROGRAM}-hub"),
            front_service: format!("{PROGRAM}-front"),
            worker_daemonset: format!("{PROGRAM}-worker-daemon-set"),
        }
    }

    /// Prefix matched against event names raised for any platform pod.
    pub fn resource_prefix(&self) -> String {
        format!("^{PROGRAM}-")
    }

    /// Selector used to locate the pod behind a platform service.
    pub fn service_selector(service: &str) -> String {
        format!("app={service}")
    }
}

impl Default for PlatformNames {
    fn default() -> Self {
        Self::new(PROGRAM)
    }
}

/// Labels stamped on every resource the program creates itself.
pub fn ownership_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), PROGRAM.to_string());
    labels.insert(LABEL_CREATED_BY.to_string(), PROGRAM.to_string());
    labels
}
