//! Trailing-edge debouncer with a single pending task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default reconcile window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Handle to a spawned debounce task.
///
/// Every [`Debouncer::trigger`] pushes the deadline to `now + window`; when the
/// deadline passes without another trigger the task emits one `()` on the fire
/// channel. At most one fire is queued at a time. Cancelling stops the task
/// without firing and closes the fire channel.
#[derive(Debug, Clone)]
pub struct Debouncer {
    poke: Arc<Notify>,
    cancel: CancellationToken,
}

impl Debouncer {
    pub fn spawn(window: Duration, parent: &CancellationToken) -> (Self, mpsc::Receiver<()>) {
        let poke = Arc::new(Notify::new());
        let cancel = parent.child_token();
        let (fire_tx, fire_rx) = mpsc::channel::<()>(1);
        let task_poke = Arc::clone(&poke);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        debug!(pending = deadline.is_some(), "debouncer cancelled");
                        break;
                    }
                    _ = task_poke.notified() => {
                        deadline = Some(Instant::now() + window);
                    }
                    _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                        deadline = None;
                        // A full channel means a fire is already queued.
                        let _ = fire_tx.try_send(());
                    }
                }
            }
        });
        (Self { poke, cancel }, fire_rx)
    }

    pub fn trigger(&self) {
        self.poke.notify_one();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
