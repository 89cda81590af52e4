//! Bounded retry with exponential backoff for substrate calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use skiff_core::config::RetryConfig;
use skiff_substrate::{SubstrateError, SubstrateResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): doubles up to max.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails non-transiently, or runs out of
    /// attempts. Exhausted transient errors surface as `Fatal`.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> SubstrateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SubstrateResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(op, attempt, ?delay, error = %e, "transient substrate error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(SubstrateError::Fatal(format!(
                        "{op} failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SubstrateError::Transient("busy".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_becomes_fatal() {
        let calls = AtomicU32::new(0);
        let result: SubstrateResult<()> = policy(2)
            .run("provision", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SubstrateError::Transient("busy".to_string()))
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, SubstrateError::Fatal(ref m) if m.contains("after 2 attempts")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: SubstrateResult<()> = policy(5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SubstrateError::Fatal("no".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
