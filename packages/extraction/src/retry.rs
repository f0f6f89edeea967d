//! Bounded retries with jittered exponential backoff for provider calls.
//!
//! Client-level retries are deliberately small and short: the task-queue
//! redelivery above this layer owns long-horizon retry. This layer only
//! smooths over blips.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{ExtractionError, Result};

/// Retry settings for one logical provider call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff base; attempt n sleeps up to `base × 2ⁿ` (full jitter).
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        // Full jitter: uniform in [0, exp].
        let micros = rand::thread_rng().gen_range(0..=exp.as_micros().max(1) as u64);
        Duration::from_micros(micros)
    }
}

/// Run `call` under the policy, retrying transient failures.
///
/// Permanent errors (unparseable replies, config) return immediately.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 0..policy.max_attempts {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(policy.timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    // Unreachable unless max_attempts is 0; treat as config error.
    Err(last_err.unwrap_or_else(|| ExtractionError::Config("max_attempts is 0".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ExtractionError>(7) }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&quick_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExtractionError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ExtractionError::UnparseableReply {
                    provider: "stub",
                    reason: "nope".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&quick_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExtractionError::Timeout(Duration::from_millis(5))) }
        })
        .await;
        assert!(matches!(result, Err(ExtractionError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
