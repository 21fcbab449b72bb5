//! Target pod reconciler.
//!
//! Keeps the set of pods selected for capture in step with the cluster:
//! pod events only poke a trailing-edge debouncer, and each fire re-lists
//! pods and diffs the result against the previous set. Changes go out on a
//! delta lane, to the hub over HTTP, and to the worker DaemonSet placement.

#![forbid(unsafe_code)]

mod dataplane;
mod lister;
mod reporter;
mod snapshot;
mod syncer;

pub use dataplane::{DataPlane, WorkerDaemonSet};
pub use lister::PodLister;
pub use reporter::{HttpReporter, UpstreamReporter};
pub use snapshot::{diff, SnapshotHandle, TargetDelta, TargetSnapshot};
pub use syncer::{should_reconcile, SyncerConfig, SyncerDeps, TargetSyncer, LANE_DEPTH};
