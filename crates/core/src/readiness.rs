//! Process-wide readiness record for the platform's two front-facing pods.
//!
//! All three flags live behind one mutex. Setting a flag and deciding whether
//! the front-ingress handoff fires happen inside the same critical section, so
//! the handoff is granted to exactly one caller no matter how the hub and
//! front watchers interleave.

use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessState {
    pub hub_ready: bool,
    pub front_ready: bool,
    pub proxy_established: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessFlag {
    Hub,
    Front,
}

#[derive(Debug, Default)]
pub struct ReadinessRecord {
    state: Mutex<ReadinessState>,
}

impl ReadinessRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `flag` and report whether this caller won the front-ingress handoff.
    ///
    /// Returns `true` at most once over the lifetime of the record. The
    /// caller runs the handoff after the lock is released.
    pub fn mark(&self, flag: ReadinessFlag) -> bool {
        let mut st = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match flag {
            ReadinessFlag::Hub => st.hub_ready = true,
            ReadinessFlag::Front => st.front_ready = true,
        }
        let fire = st.hub_ready && st.front_ready && !st.proxy_established;
        if fire {
            st.proxy_established = true;
        }
        debug!(?flag, hub = st.hub_ready, front = st.front_ready, fire, "readiness updated");
        fire
    }

    pub fn snapshot(&self) -> ReadinessState {
        match self.state.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_ready(&self, flag: ReadinessFlag) -> bool {
        let st = self.snapshot();
        match flag {
            ReadinessFlag::Hub => st.hub_ready,
            ReadinessFlag::Front => st.front_ready,
        }
    }
}
