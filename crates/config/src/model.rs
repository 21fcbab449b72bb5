use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub front_port: u16,
    pub hub_port: u16,
    pub host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { front_port: 8899, hub_port: 8898, host: "127.0.0.1".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub name: String,
    pub chart: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self { name: "tapline".to_string(), chart: "tapline/tapline".to_string() }
    }
}

/// Targeting and deploy settings for `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    pub regex: String,
    pub namespaces: Vec<String>,
    pub all_namespaces: bool,
    pub dry_run: bool,
    pub self_namespace: String,
    pub proxy: ProxyConfig,
    pub headless: bool,
    pub release: ReleaseConfig,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            regex: ".*".to_string(),
            namespaces: Vec::new(),
            all_namespaces: false,
            dry_run: false,
            self_namespace: "tapline".to_string(),
            proxy: ProxyConfig::default(),
            headless: false,
            release: ReleaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    pub config_path: Option<PathBuf>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Fixed tool endpoint; the cluster is not used when set.
    pub url: Option<String>,
    pub allow_destructive: bool,
    /// `key.path=value` overrides applied to deploys started by the bridge.
    pub set: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub readiness_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { readiness_secs: 120 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tap: TapConfig,
    pub kube: KubeConfig,
    pub bridge: BridgeConfig,
    pub timeouts: TimeoutConfig,
}
