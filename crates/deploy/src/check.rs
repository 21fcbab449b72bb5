//! `check`: a dry-run walk through everything `start` relies on.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Pod, Service};
use tapline_core::{CancellationToken, Error, PlatformNames, PROGRAM};
use tapline_kubehub::{meets_min_version, Cluster, ClusterOptions, MIN_KUBE_VERSION};
use tapline_ops::{Ingress, KubeBackend};
use tracing::debug;

use crate::options::IngressOptions;
use crate::platform::PlatformService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckLine {
    pub ok: bool,
    pub text: String,
}

impl fmt::Display for CheckLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.ok { "✓" } else { "✗" };
        write!(f, "{mark} {}", self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub lines: Vec<CheckLine>,
}

impl CheckReport {
    pub fn pass(&mut self, text: impl Into<String>) {
        self.lines.push(CheckLine { ok: true, text: text.into() });
    }

    pub fn fail(&mut self, text: impl Into<String>) {
        self.lines.push(CheckLine { ok: false, text: text.into() });
    }

    pub fn passed(&self) -> bool {
        self.lines.iter().all(|l| l.ok)
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// An access the platform needs in its own namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub group: &'static str,
    pub resource: &'static str,
    pub subresource: Option<&'static str>,
    pub verb: &'static str,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() { "core" } else { self.group };
        match self.subresource {
            Some(sub) => write!(f, "{} {}/{} ({group})", self.verb, self.resource, sub),
            None => write!(f, "{} {} ({group})", self.verb, self.resource),
        }
    }
}

const fn perm(group: &'static str, resource: &'static str, subresource: Option<&'static str>, verb: &'static str) -> Permission {
    Permission { group, resource, subresource, verb }
}

pub const REQUIRED_PERMISSIONS: &[Permission] = &[
    perm("", "pods", None, "list"),
    perm("", "pods", None, "watch"),
    perm("", "pods", None, "get"),
    perm("", "services", None, "get"),
    perm("", "events", None, "watch"),
    perm("apps", "daemonsets", None, "patch"),
    perm("", "pods", Some("portforward"), "create"),
    perm("", "services", Some("proxy"), "get"),
];

/// Run every check in order. Later stages are skipped once the cluster
/// cannot be reached at all.
pub async fn run_checks(cluster_opts: &ClusterOptions, names: &PlatformNames, ingress: &IngressOptions) -> CheckReport {
    let mut report = CheckReport::default();

    let cluster = match Cluster::connect(cluster_opts).await {
        Ok(c) => {
            report.pass(format!("kubeconfig loaded; API server {} is reached directly", c.server()));
            c
        }
        Err(e) => {
            report.fail(failure_text("cannot use the cluster", &e));
            return report;
        }
    };

    match cluster.server_version().await {
        Ok(info) if meets_min_version(&info) => report.pass(format!("Kubernetes {} is supported", info.git_version)),
        Ok(info) => report.fail(format!(
            "Kubernetes {} is older than the minimum supported {}.{}",
            info.git_version, MIN_KUBE_VERSION.0, MIN_KUBE_VERSION.1
        )),
        Err(e) => report.fail(failure_text("cannot read the server version", &e)),
    }

    let ns = names.self_namespace.as_str();
    for p in REQUIRED_PERMISSIONS {
        match cluster.can_i(Some(ns), p.group, p.resource, p.subresource, p.verb).await {
            Ok(true) => report.pass(format!("can {p} in {ns}")),
            Ok(false) => report.fail(format!("cannot {p} in {ns}")),
            Err(e) => report.fail(failure_text(&format!("cannot verify {p}"), &e)),
        }
    }

    let mut installed = true;
    for (kind, name) in [("pod", &names.hub_pod), ("pod", &names.front_pod), ("service", &names.hub_service), ("service", &names.front_service)] {
        let found = if kind == "pod" { cluster.exists::<Pod>(ns, name).await } else { cluster.exists::<Service>(ns, name).await };
        match found {
            Ok(true) => report.pass(format!("{kind} {ns}/{name} exists")),
            Ok(false) => {
                installed = false;
                report.fail(format!("{kind} {ns}/{name} not found; is {PROGRAM} running?"));
            }
            Err(e) => {
                installed = false;
                report.fail(failure_text(&format!("cannot look up {kind} {ns}/{name}"), &e));
            }
        }
    }
    if !installed {
        debug!("skipping reachability checks; platform is not fully installed");
        return report;
    }

    let cancel = CancellationToken::new();
    let li = Ingress::new(Arc::new(KubeBackend::new(cluster.clone())), &cancel);
    for which in [PlatformService::Hub, PlatformService::Front] {
        let target = which.target(names, ingress);
        match li.expose(target).await {
            Ok(s) => report.pass(format!("{} is reachable at {} ({})", s.service, s.base_url, s.mode)),
            Err(e) => report.fail(failure_text(&format!("{} is not reachable", which.service_name(names)), &e)),
        }
    }
    li.stop_all().await;
    cancel.cancel();
    report
}

fn failure_text(what: &str, e: &Error) -> String {
    match e.remediation() {
        Some(hint) => format!("{what}: {e} (hint: {hint})"),
        None => format!("{what}: {e}"),
    }
}
