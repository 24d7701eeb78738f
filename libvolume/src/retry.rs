//! Bounded retry and timeout helpers.
//!
//! These are for callers of the control plane (the reconcile loop, tests,
//! operators) and never block a state machine transition themselves.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::VolumeError;

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total attempts, including the first one.  Zero behaves like one.
    pub attempts: u32,
}

impl Retry {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// A single attempt with no retry.
    pub fn once() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    /// Run `f` until it succeeds, fails with an error that is not due to an
    /// unreachable node, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, mut f: F) -> Result<T, VolumeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VolumeError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Err(error) if error.is_unreachable() && attempt < attempts => {
                    debug!(%error, attempt, attempts, "retrying");
                    attempt += 1;
                    tokio::time::sleep(self.interval).await;
                }
                result => return result,
            }
        }
    }

    /// Poll `check` until it returns `true`; `false` once attempts run out.
    pub async fn until<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.attempts.max(1) {
            if check().await {
                return true;
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        false
    }
}

/// Await `fut` for at most `after`, mapping expiry to [`VolumeError::Timeout`].
///
/// Expiry drops `fut`, cancelling whatever it was doing.
pub async fn bounded<T, Fut>(op: &str, after: Duration, fut: Fut) -> Result<T, VolumeError>
where
    Fut: Future<Output = Result<T, VolumeError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| VolumeError::Timeout {
            op: op.to_owned(),
            after,
        })?
}
