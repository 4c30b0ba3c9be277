use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::gateway::GatewayError;

/// Bounded exponential backoff. An explicit loop, not recursion, so the
/// attempt cap is trivially testable and the stack stays flat.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            max_attempts: 10,
        }
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    identifier: &str,
    mut operation: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = policy.base_delay;
    let mut last_error = String::new();
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = format!("{err:#}");
                warn!(
                    "attempt {attempt}/{attempts} failed for {identifier}: {last_error}. \
                     Retrying in {}ms",
                    delay.as_millis()
                );
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(policy.max_delay);
                }
            }
        }
    }
    Err(GatewayError::Unavailable {
        identifier: identifier.to_string(),
        attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;

    use super::{with_retry, RetryPolicy};
    use crate::gateway::GatewayError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), "flaky op", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(anyhow!("connection reset"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("should eventually succeed");
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_attempt_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(4), "dead op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("timeout")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(GatewayError::Unavailable {
                attempts, message, ..
            }) => {
                assert_eq!(attempts, 4);
                assert!(message.contains("timeout"));
            }
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_doubles_up_to_the_cap() {
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = with_retry(&fast_policy(5), "slow op", || async {
            Err(anyhow!("unavailable"))
        })
        .await;
        // 10 + 20 + 40 + 40 ms of backoff between five attempts.
        assert_eq!(start.elapsed(), Duration::from_millis(110));
    }
}
