//! The `start` lifecycle: install, wait for the hub and front pods, expose
//! them, and keep the targeted pod set in sync until cancelled.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use k8s_openapi::api::core::v1::{Event, Pod};
use metrics::counter;
use regex::Regex;
use tapline_core::{CancellationToken, Error, ReadinessFlag, ReadinessRecord, PROGRAM};
use tapline_kubehub::{EventFilter, Multiplexer, WatchChannels, WatchEvent};
use tapline_ops::{Ingress, ServiceTarget, SessionInfo};
use tapline_syncer::{HttpReporter, SyncerConfig, SyncerDeps, TargetDelta, TargetSyncer};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::namespaces::resolve_namespaces;
use crate::options::{Collaborators, DeployOptions, HUB_HEALTH_PATH};
use crate::preview::{matching_pods, preview_lines};

const FAILURE_REASONS: [&str; 2] = ["FailedScheduling", "Failed"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// `dry_run` stopped after the preview.
    DryRun { matched: usize },
    /// Cancelled after a clean teardown.
    Stopped,
}

/// What a platform pod event means for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodTransition {
    Running,
    Deleted,
    Other,
}

pub fn classify_pod_event(ev: &WatchEvent<Pod>) -> PodTransition {
    match ev {
        WatchEvent::Added(p) | WatchEvent::Modified(p) => {
            let running = p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
            if running {
                PodTransition::Running
            } else {
                PodTransition::Other
            }
        }
        WatchEvent::Deleted(_) => PodTransition::Deleted,
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => PodTransition::Other,
    }
}

/// The failure text of a scheduling or startup failure raised after
/// `started_at`, if `ev` is one.
pub fn failure_event(ev: &Event, started_at: DateTime<Utc>) -> Option<String> {
    let reason = ev.reason.as_deref()?;
    if !FAILURE_REASONS.contains(&reason) {
        return None;
    }
    // event timestamps carry whole seconds
    let created = ev.metadata.creation_timestamp.as_ref()?.0;
    if created < started_at.trunc_subsecs(0) {
        return None;
    }
    let object = ev.involved_object.name.as_deref().unwrap_or("?");
    let message = ev.message.as_deref().unwrap_or_default();
    Some(format!("{object}: {reason}: {message}"))
}

pub struct Controller {
    options: DeployOptions,
    collab: Collaborators,
}

impl Controller {
    pub fn new(options: DeployOptions, collab: Collaborators) -> Self {
        Self { options, collab }
    }

    /// Drive one `start` invocation until `root` is cancelled or a fatal
    /// error occurs. Fatal errors cancel `root` after teardown.
    pub async fn run(self, root: &CancellationToken) -> Result<RunOutcome, Error> {
        let started_at = Utc::now();
        let opts = &self.options;
        let namespaces = resolve_namespaces(&opts.namespaces, opts.all_namespaces, &self.collab.current_namespace);
        info!(namespaces = ?namespaces, regex = %opts.regex, self_ns = %opts.names.self_namespace, "starting {PROGRAM}");

        let matched = self.preview(&namespaces).await;
        if opts.dry_run {
            return Ok(RunOutcome::DryRun { matched });
        }

        match self.collab.installer.install(&opts.install_request(&namespaces)).await {
            Ok(()) => {}
            Err(Error::AlreadyExists(what)) => info!(%what, "{PROGRAM} is already installed; reusing it"),
            Err(e) => return Err(e),
        }

        let cancel = root.child_token();
        let ingress = Ingress::new(Arc::clone(&self.collab.ingress), &cancel)
            .with_port_forward_host(opts.ingress.port_forward_host.clone());
        let mut run = Run {
            options: opts,
            collab: &self.collab,
            namespaces,
            readiness: ReadinessRecord::new(),
            ingress,
            syncer: None,
            cancel: cancel.clone(),
            started_at,
        };
        let result = run.drive().await;
        run.teardown().await;
        match result {
            Ok(()) | Err(Error::Cancelled) => Ok(RunOutcome::Stopped),
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "{PROGRAM} run failed");
                root.cancel();
                Err(e)
            }
        }
    }

    async fn preview(&self, namespaces: &[String]) -> usize {
        let opts = &self.options;
        let pods = match matching_pods(self.collab.lister.as_ref(), namespaces, &opts.regex).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not preview matching pods");
                return 0;
            }
        };
        for line in preview_lines(&pods, namespaces, &opts.regex) {
            if opts.quiet {
                info!("{line}");
            } else {
                println!("{line}");
            }
        }
        pods.len()
    }
}

enum SyncerSignal {
    Delta(TargetDelta),
    Failed(Error),
    Closed,
}

struct Run<'a> {
    options: &'a DeployOptions,
    collab: &'a Collaborators,
    namespaces: Vec<String>,
    readiness: ReadinessRecord,
    ingress: Ingress,
    syncer: Option<TargetSyncer>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Run<'_> {
    async fn drive(&mut self) -> Result<(), Error> {
        let names = &self.options.names;
        let self_ns = vec![names.self_namespace.clone()];
        let pods = Multiplexer::new(Arc::clone(&self.collab.pod_watch));
        let mut hub: WatchChannels<Pod> = pods.spawn(&self_ns, exact(&names.hub_pod)?, &self.cancel);
        let mut front: WatchChannels<Pod> = pods.spawn(&self_ns, exact(&names.front_pod)?, &self.cancel);
        let prefix = Regex::new(&names.resource_prefix()).map_err(|e| Error::PlatformFailure(format!("invalid event filter: {e}")))?;
        let mut hub_events: WatchChannels<Event> =
            Multiplexer::new(Arc::clone(&self.collab.event_watch)).spawn(&self_ns, EventFilter::new(prefix).with_kind("Pod"), &self.cancel);

        let deadline = tokio::time::sleep_until(Instant::now() + self.options.readiness_deadline);
        tokio::pin!(deadline);
        loop {
            let waiting = !(self.readiness.is_ready(ReadinessFlag::Hub) && self.readiness.is_ready(ReadinessFlag::Front));
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = &mut deadline, if waiting => return Err(self.deadline_error()),
                ev = hub.events.recv() => match ev {
                    Some(ev) => self.on_platform_pod(ReadinessFlag::Hub, ev).await?,
                    None => return Ok(()),
                },
                ev = front.events.recv() => match ev {
                    Some(ev) => self.on_platform_pod(ReadinessFlag::Front, ev).await?,
                    None => return Ok(()),
                },
                ev = hub_events.events.recv() => match ev {
                    Some(WatchEvent::Added(e) | WatchEvent::Modified(e)) => self.on_platform_event(&e)?,
                    Some(_) => {}
                    None => return Ok(()),
                },
                Some(e) = hub.errors.recv() => warn!(error = %e, "hub pod watch error; resubscribing"),
                Some(e) = front.errors.recv() => warn!(error = %e, "front pod watch error; resubscribing"),
                Some(e) = hub_events.errors.recv() => warn!(error = %e, "platform event watch error; resubscribing"),
                signal = next_syncer_signal(&mut self.syncer) => match signal {
                    SyncerSignal::Delta(d) => debug!(added = d.added.len(), removed = d.removed.len(), "targeted set changed"),
                    SyncerSignal::Failed(e) => return Err(e),
                    SyncerSignal::Closed => return Ok(()),
                },
            }
        }
    }

    async fn on_platform_pod(&mut self, flag: ReadinessFlag, ev: WatchEvent<Pod>) -> Result<(), Error> {
        match classify_pod_event(&ev) {
            PodTransition::Running => {
                let first = !self.readiness.is_ready(flag);
                let handoff = self.readiness.mark(flag);
                if first {
                    info!(pod = %self.pod_name(flag), "platform pod is running");
                }
                if first && flag == ReadinessFlag::Hub {
                    self.on_hub_ready().await?;
                }
                if handoff {
                    self.on_front_handoff().await?;
                }
                Ok(())
            }
            PodTransition::Deleted => Err(Error::PlatformFailure(format!("pod {} was deleted", self.pod_name(flag)))),
            PodTransition::Other => Ok(()),
        }
    }

    fn on_platform_event(&self, ev: &Event) -> Result<(), Error> {
        match failure_event(ev, self.started_at) {
            Some(msg) => {
                counter!("tapline_platform_failures_total").increment(1);
                warn!("{msg}");
                Err(Error::PlatformFailure(msg))
            }
            None => Ok(()),
        }
    }

    async fn on_hub_ready(&mut self) -> Result<(), Error> {
        let opts = self.options;
        let target = ServiceTarget::new(&opts.names.self_namespace, &opts.names.hub_service, &opts.ingress.host, opts.ingress.hub_port)
            .with_health_path(HUB_HEALTH_PATH);
        let hub = self.ingress.expose(target).await?;
        info!(url = %hub.base_url, mode = %hub.mode, "hub is available");

        let reporter = HttpReporter::new(&hub.base_url, &self.cancel)?;
        let config = SyncerConfig::new(opts.regex.clone(), self.namespaces.clone(), opts.names.self_namespace.clone());
        let deps = SyncerDeps {
            lister: Arc::clone(&self.collab.lister),
            reporter: Some(Arc::new(reporter)),
            data_plane: Arc::clone(&self.collab.data_plane),
        };
        let watch = Multiplexer::new(Arc::clone(&self.collab.pod_watch)).spawn::<Pod>(
            &self.namespaces,
            EventFilter::new(opts.regex.clone()),
            &self.cancel,
        );
        self.syncer = Some(TargetSyncer::start(config, deps, watch, &self.cancel).await?);
        Ok(())
    }

    async fn on_front_handoff(&mut self) -> Result<(), Error> {
        let opts = self.options;
        let target = ServiceTarget::new(&opts.names.self_namespace, &opts.names.front_service, &opts.ingress.host, opts.ingress.front_port);
        let front = self.ingress.expose(target).await?;
        announce(&front, opts.quiet, opts.headless);
        Ok(())
    }

    fn pod_name(&self, flag: ReadinessFlag) -> &str {
        match flag {
            ReadinessFlag::Hub => &self.options.names.hub_pod,
            ReadinessFlag::Front => &self.options.names.front_pod,
        }
    }

    fn deadline_error(&self) -> Error {
        let state = self.readiness.snapshot();
        let mut missing = Vec::new();
        if !state.hub_ready {
            missing.push(self.options.names.hub_pod.as_str());
        }
        if !state.front_ready {
            missing.push(self.options.names.front_pod.as_str());
        }
        Error::ReadinessDeadline { target: missing.join(", "), secs: self.options.readiness_deadline.as_secs() }
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(syncer) = self.syncer.take() {
            syncer.shutdown().await;
        }
        self.ingress.stop_all().await;
        info!("{PROGRAM} stopped");
    }
}

fn exact(name: &str) -> Result<EventFilter, Error> {
    EventFilter::exact(name).map_err(|e| Error::PlatformFailure(format!("invalid watch filter for {name}: {e}")))
}

async fn next_syncer_signal(syncer: &mut Option<TargetSyncer>) -> SyncerSignal {
    let Some(s) = syncer.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(d) = s.deltas.recv() => SyncerSignal::Delta(d),
        e = s.errors.recv() => match e {
            Some(e) => SyncerSignal::Failed(e),
            None => SyncerSignal::Closed,
        },
    }
}

fn announce(front: &SessionInfo, quiet: bool, headless: bool) {
    info!(url = %front.base_url, mode = %front.mode, "{PROGRAM} is available");
    if !quiet {
        println!("{PROGRAM} is available at {}", front.base_url);
    }
    if headless {
        return;
    }
    if let Err(e) = webbrowser::open(&front.base_url) {
        warn!(error = %e, url = %front.base_url, "could not open a browser");
    }
}
