//! Bounded exponential backoff for upstream calls.
//!
//! - Transient failures (5xx, timeouts, connection errors) → retry
//! - HTTP 429 → retry with double the normal delay
//! - Anything else → fail immediately
//! - Backoff: base, 2×base, 4×base, ... (exponent capped at 5)

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{ErrorKind, UpstreamError};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Single attempt, no waiting. Used by tests and fakes.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    fn delay_for(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let exp = (attempt.saturating_sub(1)).min(5);
        let delay = self.base_delay * (1u32 << exp);
        if kind == ErrorKind::RateLimited {
            delay * 2
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `what` names the operation in log lines.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.kind().is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt, e.kind());
                    warn!(
                        operation = what,
                        attempt,
                        kind = %e.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "upstream call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let out = policy
            .run("test", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(UpstreamError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let err = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::RateLimited("slow down".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let _ = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(UpstreamError::Rejected {
                    status: 401,
                    body: "bad key".into(),
                })
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_millis(100));
        assert_eq!(p.delay_for(1, ErrorKind::TransientNetwork), Duration::from_millis(100));
        assert_eq!(p.delay_for(3, ErrorKind::TransientNetwork), Duration::from_millis(400));
        assert_eq!(p.delay_for(9, ErrorKind::TransientNetwork), Duration::from_millis(3200));
        assert_eq!(p.delay_for(1, ErrorKind::RateLimited), Duration::from_millis(200));
    }
}
