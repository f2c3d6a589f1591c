//! A reusable replacement for the original's decorator-style `robustify`
//! (spec §9 design note): `(max_attempts, interval, retriable predicate)` as
//! data, not a macro or annotation.

use std::future::Future;
use std::time::Duration;

use mbs_errors::Retriable;

use crate::{MbsError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// 3 attempts, 30s apart: the dump phase's outer retry (spec §4.5).
    pub const DUMP: RetryPolicy = RetryPolicy::new(3, Duration::from_secs(30));
    /// 120 attempts, 5s apart: fsyncunlock is retried aggressively because
    /// releasing the lock matters more than acquiring it (spec §4.4).
    pub const FSYNCUNLOCK: RetryPolicy = RetryPolicy::new(120, Duration::from_secs(5));
    /// 5 attempts, 5s apart: EBS snapshot sharing (spec §4.6).
    pub const SHARE_SNAPSHOT: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(5));
}

/// Runs `op` until it succeeds, exhausts `policy.max_attempts`, or fails with
/// a non-retriable error. `op` receives the 1-based attempt number.
pub async fn robustify<F, Fut, T>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let exhausted = attempt >= policy.max_attempts;
                if exhausted || !err.is_retriable() {
                    return Err(err);
                }
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "retriable error, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// spec §4.1: "A task is reschedulable iff tryCount < MAX_NO_RETRIES AND the
/// exception is retriable." Computed fresh on every failing run, never
/// cached, so a task that has already exhausted its retries stops being
/// marked reschedulable even if the underlying error is itself retriable.
pub fn compute_reschedulable(try_count: u32, max_no_retries: u32, err: &MbsError) -> bool {
    try_count < max_no_retries && err.is_retriable()
}

/// `raiseIfNotRetriable`: swallow (and log) a retriable error, re-raise
/// anything else. Used by cleanup code that wants to keep trying on its own
/// schedule rather than through [`robustify`].
pub fn raise_if_not_retriable(err: MbsError) -> Result<()> {
    if err.is_retriable() {
        tracing::warn!(error = %err, "caught a retriable exception");
        Ok(())
    } else {
        tracing::debug!(error = %err, "re-raising a non-retriable exception");
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_up_to_max_attempts_then_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = robustify(RetryPolicy::new(3, Duration::from_millis(1)), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MbsError::Connection { uri: "x".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retriable_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = robustify(RetryPolicy::new(5, Duration::from_millis(1)), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MbsError::Extract) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reschedulable_requires_both_attempts_left_and_retriable_error() {
        let retriable = MbsError::Connection { uri: "x".into() };
        let non_retriable = MbsError::Extract;
        assert!(compute_reschedulable(0, 3, &retriable));
        assert!(compute_reschedulable(2, 3, &retriable));
        assert!(!compute_reschedulable(3, 3, &retriable));
        assert!(!compute_reschedulable(0, 3, &non_retriable));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = robustify(RetryPolicy::new(3, Duration::from_millis(1)), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(MbsError::Connection { uri: "x".into() })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
