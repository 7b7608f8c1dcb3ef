//! Bounded read-verify-write retries
//!
//! There are no locks around documents shared with other services. Every
//! mutation reads the latest revision, writes the change onto it, then reads
//! again to confirm the change is there. Lost races are retried after a fixed
//! backoff, and the attempt count is bounded.

use super::{StoreError, StoreResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry bounds for optimistic updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up, at least one
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(500))
    }
}

/// Apply a change with read-verify-retry semantics
///
/// `read` fetches the latest document, `write` applies the change onto that
/// document and stores it, `verify` checks a freshly read document carries
/// the change. Returns the verified document.
pub async fn update_verified<T, R, RFut, W, WFut, V>(
    policy: &RetryPolicy,
    what: &str,
    mut read: R,
    mut write: W,
    verify: V,
) -> StoreResult<T>
where
    R: FnMut() -> RFut,
    RFut: Future<Output = StoreResult<T>>,
    W: FnMut(T) -> WFut,
    WFut: Future<Output = StoreResult<()>>,
    V: Fn(&T) -> bool,
{
    for attempt in 1..=policy.max_attempts {
        let latest = read().await?;

        match write(latest).await {
            Ok(()) => {
                let stored = read().await?;
                if verify(&stored) {
                    debug!(what = %what, attempt, "Update verified");
                    return Ok(stored);
                }
                warn!(what = %what, attempt, "Update not reflected in store, retrying");
            }
            Err(StoreError::Conflict(reason)) => {
                debug!(what = %what, attempt, reason = %reason, "Update lost a race, retrying");
            }
            Err(e) => return Err(e),
        }

        if attempt < policy.max_attempts && !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(StoreError::RetriesExhausted {
        what: what.to_string(),
        attempts: policy.max_attempts,
    })
}
