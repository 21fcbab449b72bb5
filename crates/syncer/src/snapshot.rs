use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tapline_core::{PodKey, PodRef};
use tokio::sync::watch;

/// Immutable view of the targeted set after one reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSnapshot {
    pub epoch: u64,
    /// Sorted by `(namespace, name)`, no duplicates.
    pub pods: Vec<PodRef>,
}

impl TargetSnapshot {
    /// Sorted, de-duplicated node names hosting targeted pods.
    pub fn nodes(&self) -> Vec<String> {
        node_set(&self.pods)
    }
}

pub(crate) fn node_set(pods: &[PodRef]) -> Vec<String> {
    let mut nodes: Vec<String> = pods.iter().filter(|p| !p.node_name.is_empty()).map(|p| p.node_name.clone()).collect();
    nodes.sort();
    nodes.dedup();
    nodes
}

/// Change between two consecutive targeted sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDelta {
    pub added: Vec<PodRef>,
    pub removed: Vec<PodRef>,
}

impl TargetDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = new \ old`, `removed = old \ new`, by pod identity.
pub fn diff(old: &[PodRef], new: &[PodRef]) -> TargetDelta {
    let old_keys: BTreeMap<PodKey, &PodRef> = old.iter().map(|p| (p.key(), p)).collect();
    let new_keys: BTreeMap<PodKey, &PodRef> = new.iter().map(|p| (p.key(), p)).collect();
    TargetDelta {
        added: new_keys.iter().filter(|(k, _)| !old_keys.contains_key(*k)).map(|(_, p)| (*p).clone()).collect(),
        removed: old_keys.iter().filter(|(k, _)| !new_keys.contains_key(*k)).map(|(_, p)| (*p).clone()).collect(),
    }
}

/// Reader side of the published targeted set.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    snap: Arc<ArcSwap<TargetSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl SnapshotHandle {
    pub fn current(&self) -> Arc<TargetSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Writer side, owned by the reconcile loop.
pub(crate) struct SnapshotPublisher {
    snap: Arc<ArcSwap<TargetSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

impl SnapshotPublisher {
    pub(crate) fn new() -> (Self, SnapshotHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(TargetSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        (Self { snap: Arc::clone(&snap), epoch_tx, epoch: 0 }, SnapshotHandle { snap, epoch_rx })
    }

    pub(crate) fn current(&self) -> Arc<TargetSnapshot> {
        self.snap.load_full()
    }

    pub(crate) fn publish(&mut self, pods: Vec<PodRef>) -> Arc<TargetSnapshot> {
        self.epoch = self.epoch.saturating_add(1);
        let next = Arc::new(TargetSnapshot { epoch: self.epoch, pods });
        self.snap.store(Arc::clone(&next));
        let _ = self.epoch_tx.send(self.epoch);
        next
    }
}
