use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Error;

/// Bounded retry: `retries` attempts, each capped at `attempt_timeout`,
/// separated by `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub attempt_timeout: Duration,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retries: 3, attempt_timeout: Duration::from_secs(2), interval: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. The last failure is returned when
/// every attempt fails; a per-attempt timeout counts as a failure. Cancellation
/// surfaces as [`Error::Cancelled`].
pub async fn retry_with_context<T, F, Fut>(policy: &RetryPolicy, cancel: &CancellationToken, mut op: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.attempts();
    let mut last = None;
    for attempt in 1..=attempts {
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
            r = tokio::time::timeout(policy.attempt_timeout, op(attempt)) => r,
        };
        match res {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(e)) => {
                debug!(attempt, error = %e, "attempt failed");
                last = Some(e);
            }
            Err(_) => {
                debug!(attempt, timeout_ms = policy.attempt_timeout.as_millis() as u64, "attempt timed out");
                last = Some(anyhow!("attempt {} timed out after {:?}", attempt, policy.attempt_timeout));
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled.into()),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("no attempts made")))
}
