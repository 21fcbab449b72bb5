use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, histogram};
use regex::Regex;
use tapline_core::debounce::DEFAULT_WINDOW;
use tapline_core::{CancellationToken, Debouncer, Error, PodRef, ALL_NAMESPACES};
use tapline_kubehub::{WatchChannels, WatchEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dataplane::DataPlane;
use crate::lister::PodLister;
use crate::reporter::UpstreamReporter;
use crate::snapshot::{diff, node_set, SnapshotHandle, SnapshotPublisher, TargetDelta, TargetSnapshot};

/// Depth of the delta and error lanes.
pub const LANE_DEPTH: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub regex: Regex,
    /// Namespaces to target; `[""]` means all of them.
    pub namespaces: Vec<String>,
    pub self_namespace: String,
    pub window: Duration,
}

impl SyncerConfig {
    pub fn new(regex: Regex, namespaces: Vec<String>, self_namespace: impl Into<String>) -> Self {
        Self { regex, namespaces, self_namespace: self_namespace.into(), window: DEFAULT_WINDOW }
    }

    fn namespace_selected(&self, ns: &str) -> bool {
        self.namespaces.iter().any(|n| n == ALL_NAMESPACES || n == ns)
    }

    /// The targeting predicate every member of the set satisfies.
    pub fn admits(&self, pod: &PodRef) -> bool {
        pod.is_targetable()
            && self.regex.is_match(&pod.name)
            && self.namespace_selected(&pod.namespace)
            && pod.namespace != self.self_namespace
    }
}

/// Collaborators a reconcile talks to.
#[derive(Clone)]
pub struct SyncerDeps {
    pub lister: Arc<dyn PodLister>,
    pub reporter: Option<Arc<dyn UpstreamReporter>>,
    pub data_plane: Arc<dyn DataPlane>,
}

/// Running reconciler. Deltas and taxonomy-tagged failures arrive on the
/// public lanes; the error lane closes when the loop stops.
pub struct TargetSyncer {
    pub deltas: mpsc::Receiver<TargetDelta>,
    pub errors: mpsc::Receiver<Error>,
    snapshots: SnapshotHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TargetSyncer {
    /// Run the initial reconcile, then keep the set current from `watch`.
    pub async fn start(
        config: SyncerConfig,
        deps: SyncerDeps,
        watch: WatchChannels<Pod>,
        parent: &CancellationToken,
    ) -> Result<Self, Error> {
        let cancel = parent.child_token();
        let (delta_tx, deltas) = mpsc::channel(LANE_DEPTH);
        let (error_tx, errors) = mpsc::channel(LANE_DEPTH);
        let (publisher, snapshots) = SnapshotPublisher::new();
        let mut state = Reconciler { config, deps, publisher, nodes: Vec::new(), report_pending: false, delta_tx };
        state.reconcile().await?;
        info!(
            targeted = state.publisher.current().pods.len(),
            namespaces = ?state.config.namespaces,
            regex = %state.config.regex,
            "target syncer started"
        );
        let task = tokio::spawn(run(state, watch, error_tx, cancel.clone()));
        Ok(Self { deltas, errors, snapshots, cancel, task })
    }

    pub fn current(&self) -> Arc<TargetSnapshot> {
        self.snapshots.current()
    }

    pub fn snapshots(&self) -> SnapshotHandle {
        self.snapshots.clone()
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct Reconciler {
    config: SyncerConfig,
    deps: SyncerDeps,
    publisher: SnapshotPublisher,
    /// Last placement the data plane accepted.
    nodes: Vec<String>,
    /// The last upstream push failed.
    report_pending: bool,
    delta_tx: mpsc::Sender<TargetDelta>,
}

impl Reconciler {
    /// Re-list, publish the change if any, report upstream and move workers.
    async fn reconcile(&mut self) -> Result<bool, Error> {
        let started = Instant::now();
        counter!("tapline_reconcile_total").increment(1);
        let listed = self
            .deps
            .lister
            .list_running(&self.config.namespaces, &self.config.regex)
            .await
            .map_err(|e| match e {
                Error::PodList(_) => e,
                other => Error::PodList(other.to_string()),
            })?;
        let mut next: Vec<PodRef> = listed.into_iter().filter(|p| self.config.admits(p)).collect();
        next.sort_by_key(PodRef::key);
        next.dedup_by(|a, b| a.key() == b.key());

        let current = self.publisher.current();
        let delta = diff(&current.pods, &next);
        histogram!("tapline_reconcile_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        let changed = !delta.is_empty();
        let snap = if changed {
            for p in &delta.added {
                info!(pod = %p.key(), "targeted pod");
            }
            for p in &delta.removed {
                info!(pod = %p.key(), "untargeted pod");
            }
            let snap = self.publisher.publish(next);
            if self.delta_tx.send(delta).await.is_err() {
                debug!("delta consumer gone");
            }
            snap
        } else {
            debug!(targeted = next.len(), "targeted set unchanged");
            current
        };
        if changed || self.report_pending {
            self.report(&snap.pods).await;
        }
        self.place_workers(node_set(&snap.pods)).await?;
        Ok(changed)
    }

    async fn report(&mut self, pods: &[PodRef]) {
        let Some(reporter) = &self.deps.reporter else { return };
        match reporter.report(pods).await {
            Ok(()) => {
                if self.report_pending {
                    info!(targeted = pods.len(), "targeted pods reported after earlier failure");
                }
                self.report_pending = false;
            }
            Err(e) => {
                counter!("tapline_report_failures_total").increment(1);
                warn!(error = %e, "failed to report targeted pods; next reconcile retries");
                self.report_pending = true;
            }
        }
    }

    async fn place_workers(&mut self, nodes: Vec<String>) -> Result<(), Error> {
        if nodes == self.nodes {
            return Ok(());
        }
        let res = if nodes.is_empty() { self.deps.data_plane.reset().await } else { self.deps.data_plane.apply(&nodes).await };
        res.map_err(|e| match e {
            Error::DataPlaneUpdate(_) => e,
            other => Error::DataPlaneUpdate(other.to_string()),
        })?;
        info!(nodes = nodes.len(), "worker placement updated");
        self.nodes = nodes;
        Ok(())
    }
}

/// Whether a watch event may change the targeted set.
pub fn should_reconcile(ev: &WatchEvent<Pod>) -> bool {
    match ev {
        WatchEvent::Added(_) | WatchEvent::Deleted(_) => true,
        // only once an address is assigned
        WatchEvent::Modified(p) => p.status.as_ref().and_then(|s| s.pod_ip.as_deref()).is_some_and(|ip| !ip.is_empty()),
        WatchEvent::Bookmark(_) | WatchEvent::Error(_) => false,
    }
}

async fn run(mut state: Reconciler, watch: WatchChannels<Pod>, error_tx: mpsc::Sender<Error>, cancel: CancellationToken) {
    let WatchChannels { mut events, mut errors } = watch;
    let (debouncer, mut fires) = Debouncer::spawn(state.config.window, &cancel);
    let mut events_open = true;
    let mut errors_open = true;
    let failure = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            ev = events.recv(), if events_open => match ev {
                Some(ev) => {
                    if should_reconcile(&ev) {
                        debouncer.trigger();
                    }
                }
                None => events_open = false,
            },
            err = errors.recv(), if errors_open => match err {
                Some(Error::PodWatch(m)) => break Some(Error::PodWatch(m)),
                Some(other) => break Some(Error::PodWatch(other.to_string())),
                None => errors_open = false,
            },
            fire = fires.recv() => match fire {
                Some(()) => {
                    if let Err(e) = state.reconcile().await {
                        break Some(e);
                    }
                }
                None => break None,
            },
        }
    };
    debouncer.cancel();
    if let Some(e) = failure {
        error!(kind = %e.kind(), error = %e, "target syncer stopped");
        let _ = error_tx.send(e).await;
    }
    let mut drained = 0usize;
    while events.try_recv().is_ok() {
        drained += 1;
    }
    debug!(drained, "target syncer exited");
}
