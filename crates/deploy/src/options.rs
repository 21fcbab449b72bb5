use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Event, Pod};
use regex::Regex;
use serde_json::{json, Value};
use tapline_core::{PlatformNames, PROGRAM};
use tapline_kubehub::{Cluster, WatchSource};
use tapline_ops::{IngressBackend, KubeBackend};
use tapline_syncer::{DataPlane, PodLister, WorkerDaemonSet};
use tracing::warn;

use crate::installer::{InstallRequest, Installer};

pub const DEFAULT_FRONT_PORT: u16 = 8899;
pub const DEFAULT_HUB_PORT: u16 = 8898;
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
pub const HUB_HEALTH_PATH: &str = "/echo";
pub const DEFAULT_READINESS_DEADLINE: Duration = Duration::from_secs(120);
/// Seconds; overrides the readiness deadline.
pub const HUB_TIMEOUT_ENV: &str = "TAPLINE_HUB_TIMEOUT_SEC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOptions {
    pub name: String,
    pub chart: String,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self { name: PROGRAM.to_string(), chart: format!("{PROGRAM}/{PROGRAM}") }
    }
}

/// Where the platform's services are exposed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressOptions {
    pub host: String,
    pub front_port: u16,
    pub hub_port: u16,
    pub port_forward_host: Option<String>,
}

impl Default for IngressOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            front_port: DEFAULT_FRONT_PORT,
            hub_port: DEFAULT_HUB_PORT,
            port_forward_host: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub regex: Regex,
    /// Explicit `-n` list; may be empty.
    pub namespaces: Vec<String>,
    pub all_namespaces: bool,
    pub names: PlatformNames,
    pub release: ReleaseOptions,
    pub ingress: IngressOptions,
    pub dry_run: bool,
    /// Skip opening the browser.
    pub headless: bool,
    /// Keep stdout untouched; everything goes to the log.
    pub quiet: bool,
    pub readiness_deadline: Duration,
}

impl DeployOptions {
    pub fn new(regex: Regex) -> Self {
        Self {
            regex,
            namespaces: Vec::new(),
            all_namespaces: false,
            names: PlatformNames::default(),
            release: ReleaseOptions::default(),
            ingress: IngressOptions::default(),
            dry_run: false,
            headless: false,
            quiet: false,
            readiness_deadline: readiness_deadline_from_env(DEFAULT_READINESS_DEADLINE),
        }
    }

    /// Chart values derived from the run's targeting.
    pub fn chart_values(&self, namespaces: &[String]) -> Value {
        json!({
            "tap": {
                "regex": self.regex.as_str(),
                "namespaces": namespaces,
                "release": { "name": self.release.name, "namespace": self.names.self_namespace },
            }
        })
    }

    pub fn install_request(&self, namespaces: &[String]) -> InstallRequest {
        InstallRequest {
            release: self.release.name.clone(),
            chart: self.release.chart.clone(),
            namespace: self.names.self_namespace.clone(),
            values: self.chart_values(namespaces),
        }
    }
}

pub fn readiness_deadline_from_env(default: Duration) -> Duration {
    match std::env::var(HUB_TIMEOUT_ENV) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(value = %raw, "invalid {HUB_TIMEOUT_ENV}; using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Everything a lifecycle run talks to outside the process.
#[derive(Clone)]
pub struct Collaborators {
    pub current_namespace: String,
    pub pod_watch: Arc<dyn WatchSource<Pod>>,
    pub event_watch: Arc<dyn WatchSource<Event>>,
    pub lister: Arc<dyn PodLister>,
    pub installer: Arc<dyn Installer>,
    pub ingress: Arc<dyn IngressBackend>,
    pub data_plane: Arc<dyn DataPlane>,
}

impl Collaborators {
    pub fn for_cluster(cluster: &Cluster, names: &PlatformNames, installer: Arc<dyn Installer>) -> Self {
        let shared = Arc::new(cluster.clone());
        Self {
            current_namespace: cluster.current_namespace().to_string(),
            pod_watch: shared.clone(),
            event_watch: shared.clone(),
            lister: shared,
            installer,
            ingress: Arc::new(KubeBackend::new(cluster.clone())),
            data_plane: Arc::new(WorkerDaemonSet::new(cluster.clone(), names)),
        }
    }
}
