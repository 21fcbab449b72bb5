//! Chart installer collaborator. The platform chart is applied by the `helm`
//! binary; this module only shapes its arguments and classifies its failures.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tapline_core::{Error, PROGRAM};
use tapline_kubehub::ClusterOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Overrides the chart reference handed to `helm install`.
pub const CHART_PATH_ENV: &str = "TAPLINE_HELM_CHART_PATH";

const NAME_IN_USE: &str = "cannot re-use a name that is still in use";

#[derive(Debug, Clone, PartialEq)]
pub struct InstallRequest {
    pub release: String,
    pub chart: String,
    pub namespace: String,
    /// Chart values, piped to the installer as a values file.
    pub values: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed,
    NotInstalled,
}

#[async_trait]
pub trait Installer: Send + Sync + 'static {
    /// Apply the chart. An existing release surfaces as [`Error::AlreadyExists`].
    async fn install(&self, req: &InstallRequest) -> Result<(), Error>;

    /// Remove the release; a missing release is not an error.
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<UninstallOutcome, Error>;
}

/// Runs `helm` against the operator's selected cluster.
#[derive(Debug, Clone)]
pub struct HelmInstaller {
    binary: PathBuf,
    cluster: ClusterOptions,
}

impl HelmInstaller {
    pub fn new(cluster: ClusterOptions) -> Self {
        Self { binary: PathBuf::from("helm"), cluster }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn cluster_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(p) = &self.cluster.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(p.display().to_string());
        }
        if let Some(c) = &self.cluster.context {
            args.push("--kube-context".to_string());
            args.push(c.clone());
        }
        args
    }

    async fn helm(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<HelmOutput, Error> {
        debug!(binary = %self.binary.display(), args = ?args, "running helm");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to run {}: {e}", self.binary.display())))?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&bytes).await.map_err(|e| Error::Transport(format!("writing chart values: {e}")))?;
            drop(pipe);
        }
        let out = child.wait_with_output().await.map_err(|e| Error::Transport(format!("waiting for helm: {e}")))?;
        Ok(HelmOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

struct HelmOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Chart reference to install, honoring [`CHART_PATH_ENV`].
pub fn chart_reference(default: &str) -> String {
    match std::env::var(CHART_PATH_ENV) {
        Ok(p) if !p.trim().is_empty() => p,
        _ => default.to_string(),
    }
}

pub(crate) fn install_args(req: &InstallRequest) -> Vec<String> {
    vec![
        "install".into(),
        req.release.clone(),
        chart_reference(&req.chart),
        "--namespace".into(),
        req.namespace.clone(),
        "--create-namespace".into(),
        "--values".into(),
        "-".into(),
    ]
}

pub(crate) fn classify_install_failure(release: &str, stderr: &str) -> Error {
    if stderr.contains(NAME_IN_USE) {
        return Error::AlreadyExists(format!("release {release}"));
    }
    if stderr.to_ascii_lowercase().contains("forbidden") {
        return Error::PermissionDenied(stderr.to_string());
    }
    Error::Transport(format!("helm install {release}: {stderr}"))
}

pub(crate) fn classify_uninstall_failure(release: &str, stderr: &str) -> Result<UninstallOutcome, Error> {
    if stderr.contains("not found") {
        return Ok(UninstallOutcome::NotInstalled);
    }
    if stderr.to_ascii_lowercase().contains("forbidden") {
        return Err(Error::PermissionDenied(stderr.to_string()));
    }
    Err(Error::Transport(format!("helm uninstall {release}: {stderr}")))
}

#[async_trait]
impl Installer for HelmInstaller {
    async fn install(&self, req: &InstallRequest) -> Result<(), Error> {
        let mut args = install_args(req);
        args.extend(self.cluster_args());
        let values = serde_json::to_vec(&req.values).map_err(|e| Error::Transport(e.to_string()))?;
        let out = self.helm(args, Some(values)).await?;
        if !out.success {
            return Err(classify_install_failure(&req.release, &out.stderr));
        }
        info!(release = %req.release, ns = %req.namespace, "{PROGRAM} installed");
        debug!(output = %out.stdout.trim(), "helm install");
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<UninstallOutcome, Error> {
        let mut args = vec!["uninstall".to_string(), release.to_string(), "--namespace".to_string(), namespace.to_string()];
        args.extend(self.cluster_args());
        let out = self.helm(args, None).await?;
        if out.success {
            info!(release, ns = %namespace, "{PROGRAM} uninstalled");
            return Ok(UninstallOutcome::Removed);
        }
        let outcome = classify_uninstall_failure(release, &out.stderr)?;
        debug!(release, ns = %namespace, "nothing to uninstall");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_in_use_is_already_exists() {
        let err = classify_install_failure("tapline", "Error: INSTALLATION FAILED: cannot re-use a name that is still in use");
        assert_eq!(err, Error::AlreadyExists("release tapline".into()));
        let denied = classify_install_failure("tapline", "Error: pods is forbidden: User \"dev\" cannot create");
        assert!(matches!(denied, Error::PermissionDenied(_)));
    }

    #[test]
    fn missing_release_uninstalls_cleanly() {
        assert_eq!(
            classify_uninstall_failure("tapline", "Error: uninstall: Release not loaded: tapline: release: not found"),
            Ok(UninstallOutcome::NotInstalled)
        );
        assert!(classify_uninstall_failure("tapline", "Error: Kubernetes cluster unreachable").is_err());
    }

    #[test]
    fn install_reads_values_from_stdin() {
        let req = InstallRequest {
            release: "tapline".into(),
            chart: "tapline/tapline".into(),
            namespace: "observability".into(),
            values: serde_json::json!({}),
        };
        let args = install_args(&req);
        assert_eq!(&args[..2], &["install".to_string(), "tapline".to_string()]);
        assert!(args.windows(2).any(|w| w == ["--namespace", "observability"]));
        assert!(args.ends_with(&["--values".to_string(), "-".to_string()]));
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_error() {
        let helm = HelmInstaller::new(ClusterOptions::default()).with_binary("/nonexistent/helm-binary");
        let err = helm.uninstall("tapline", "tapline").await.expect_err("spawn fails");
        assert!(matches!(err, Error::Transport(ref m) if m.contains("failed to run")), "{err:?}");
    }
}
