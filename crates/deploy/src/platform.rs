//! Entry points used outside a `start` run: `expose`, `open`, `stop` and the
//! bridge's status and start/stop tools.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use tapline_core::names::LABEL_APP_NAME;
use tapline_core::{CancellationToken, Error, PlatformNames, PodRef, PROGRAM};
use tapline_kubehub::Cluster;
use tapline_ops::{Ingress, ServiceTarget, SessionInfo};
use tracing::{debug, info};

use crate::installer::{Installer, UninstallOutcome};
use crate::options::{IngressOptions, HUB_HEALTH_PATH};

/// One of the platform's two HTTP services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformService {
    Front,
    Hub,
}

impl PlatformService {
    pub fn service_name<'a>(&self, names: &'a PlatformNames) -> &'a str {
        match self {
            PlatformService::Front => &names.front_service,
            PlatformService::Hub => &names.hub_service,
        }
    }

    pub fn health_path(&self) -> &'static str {
        match self {
            PlatformService::Front => "",
            PlatformService::Hub => HUB_HEALTH_PATH,
        }
    }

    pub fn local_port(&self, opts: &IngressOptions) -> u16 {
        match self {
            PlatformService::Front => opts.front_port,
            PlatformService::Hub => opts.hub_port,
        }
    }

    pub fn target(&self, names: &PlatformNames, opts: &IngressOptions) -> ServiceTarget {
        ServiceTarget::new(&names.self_namespace, self.service_name(names), &opts.host, self.local_port(opts))
            .with_health_path(self.health_path())
    }
}

/// Read-only view of the installed platform.
#[async_trait]
pub trait PlatformProbe: Send + Sync + 'static {
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
    /// Pods carrying the platform's app label.
    async fn platform_pods(&self, namespace: &str) -> Result<Vec<PodRef>, Error>;
}

#[async_trait]
impl PlatformProbe for Cluster {
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        self.exists::<Service>(namespace, name).await
    }

    async fn platform_pods(&self, namespace: &str) -> Result<Vec<PodRef>, Error> {
        let pods = self.list_by_label::<Pod>(namespace, &format!("{LABEL_APP_NAME}={PROGRAM}")).await?;
        Ok(pods.iter().map(PodRef::from).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformStatus {
    pub namespace: String,
    pub front_service: bool,
    pub hub_service: bool,
}

impl PlatformStatus {
    pub fn is_running(&self) -> bool {
        self.front_service
    }
}

pub async fn platform_status(probe: &dyn PlatformProbe, names: &PlatformNames) -> Result<PlatformStatus, Error> {
    let ns = &names.self_namespace;
    Ok(PlatformStatus {
        namespace: ns.clone(),
        front_service: probe.service_exists(ns, &names.front_service).await?,
        hub_service: probe.service_exists(ns, &names.hub_service).await?,
    })
}

/// Expose an already running platform service.
pub async fn expose_service(
    ingress: &Ingress,
    probe: &dyn PlatformProbe,
    names: &PlatformNames,
    opts: &IngressOptions,
    which: PlatformService,
) -> Result<SessionInfo, Error> {
    let service = which.service_name(names);
    if !probe.service_exists(&names.self_namespace, service).await? {
        return Err(Error::NotFound(format!(
            "service {}/{service}; is {PROGRAM} running? start it with `{PROGRAM} start`",
            names.self_namespace
        )));
    }
    ingress.expose(which.target(names, opts)).await
}

/// Uninstall the platform release. Safe to call when nothing is installed.
pub async fn stop_platform(installer: &dyn Installer, release: &str, names: &PlatformNames) -> Result<UninstallOutcome, Error> {
    let outcome = installer.uninstall(release, &names.self_namespace).await?;
    match outcome {
        UninstallOutcome::Removed => info!(release, ns = %names.self_namespace, "{PROGRAM} removed"),
        UninstallOutcome::NotInstalled => info!(release, ns = %names.self_namespace, "{PROGRAM} was not installed"),
    }
    Ok(outcome)
}

/// Polling schedule for [`wait_for_hub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubPoll {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for HubPoll {
    fn default() -> Self {
        Self { attempts: 24, interval: Duration::from_secs(5) }
    }
}

/// Poll until a running hub pod shows up. `Ok(false)` when the schedule runs
/// out first.
pub async fn wait_for_hub(probe: &dyn PlatformProbe, names: &PlatformNames, poll: HubPoll, cancel: &CancellationToken) -> Result<bool, Error> {
    for attempt in 1..=poll.attempts {
        match probe.platform_pods(&names.self_namespace).await {
            Ok(pods) => {
                if pods.iter().any(|p| p.name.contains("hub") && p.is_running()) {
                    info!(attempt, "hub pod is running");
                    return Ok(true);
                }
                debug!(attempt, pods = pods.len(), "waiting for hub pod");
            }
            Err(e) => debug!(attempt, error = %e, "listing platform pods failed"),
        }
        if attempt < poll.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(poll.interval) => {}
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports a running hub from the `ready_at`-th listing on.
    struct Slow {
        ready_at: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PlatformProbe for Slow {
        async fn service_exists(&self, _ns: &str, name: &str) -> Result<bool, Error> {
            Ok(name.ends_with("front"))
        }
        async fn platform_pods(&self, ns: &str) -> Result<Vec<PodRef>, Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let phase = if n >= self.ready_at { "Running" } else { "Pending" };
            Ok(vec![PodRef {
                name: "tapline-hub".into(),
                namespace: ns.into(),
                node_name: "n1".into(),
                phase: phase.into(),
                pod_ip: "10.0.0.9".into(),
                container_statuses: vec![],
            }])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_hub_runs() {
        let probe = Slow { ready_at: 3, calls: AtomicU32::new(0) };
        let started = tokio::time::Instant::now();
        let ready = wait_for_hub(&probe, &PlatformNames::default(), HubPoll::default(), &CancellationToken::new()).await.expect("polled");
        assert!(ready);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_schedule() {
        let probe = Slow { ready_at: u32::MAX, calls: AtomicU32::new(0) };
        let poll = HubPoll { attempts: 4, interval: Duration::from_secs(5) };
        let ready = wait_for_hub(&probe, &PlatformNames::default(), poll, &CancellationToken::new()).await.expect("polled");
        assert!(!ready);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn status_follows_front_service() {
        let probe = Slow { ready_at: 1, calls: AtomicU32::new(0) };
        let st = platform_status(&probe, &PlatformNames::default()).await.expect("status");
        assert!(st.is_running());
        assert!(!st.hub_service);
    }

    #[test]
    fn hub_target_probes_echo() {
        let t = PlatformService::Hub.target(&PlatformNames::default(), &IngressOptions::default());
        assert_eq!(t.service, "tapline-hub");
        assert_eq!(t.local_port, 8898);
        assert_eq!(t.health_url(), "http://127.0.0.1:8898/echo");
    }
}
