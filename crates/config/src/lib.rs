//! tapline configuration: one YAML file per user plus `--set` overrides.
//!
//! The file lives at `$TAPLINE_CONFIG` or `~/.tapline/config.yaml`. A missing
//! file reads as [`Config::default`]; a partial one fills the gaps from it.

#![forbid(unsafe_code)]

mod model;
pub mod overrides;

use std::path::{Path, PathBuf};

use tracing::debug;

pub use model::{BridgeConfig, Config, KubeConfig, ProxyConfig, ReleaseConfig, TapConfig, TimeoutConfig};

pub const CONFIG_ENV: &str = "TAPLINE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("unknown config key `{0}`")]
    UnknownKey(String),
    #[error("expected key.path=value, got `{0}`")]
    BadAssignment(String),
    #[error("`{key}` expects {expected}, got `{value}`")]
    BadValue { key: String, value: String, expected: &'static str },
    #[error("invalid config: {0}")]
    Invalid(serde_yaml::Error),
    #[error("cannot locate the home directory; set {CONFIG_ENV}")]
    NoHome,
}

/// `$TAPLINE_CONFIG`, else `~/.tapline/config.yaml`.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(".tapline").join("config.yaml"))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        debug!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    /// Load from `path` and apply `assignments` on top.
    pub fn load_with_overrides(path: &Path, assignments: &[String]) -> Result<Self, ConfigError> {
        Self::load(path)?.with_overrides(assignments)
    }

    pub fn with_overrides(&self, assignments: &[String]) -> Result<Self, ConfigError> {
        overrides::apply(self, assignments)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Invalid)
    }

    /// Write the full record, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io { path: path.to_path_buf(), source };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        std::fs::write(path, self.to_yaml()?).map_err(io)?;
        debug!(path = %path.display(), "config written");
        Ok(())
    }
}
