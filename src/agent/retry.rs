//! Retry with exponential backoff for transient agent failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Substrings (lower-case) that mark an error as transient.
const TRANSIENT_MARKERS: [&str; 4] = ["overloaded", "529", "rate limit", "too many requests"];

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        self.base_delay.saturating_mul(2u32.pow(exp))
    }
}

/// Whether an error looks like an overload or rate-limit condition.
pub fn is_overload_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| msg.contains(m))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempts run out.
///
/// `on_retry(attempt, delay, err)` is called before each backoff sleep.
pub async fn call_with_retry<T, F, Fut, R>(
    policy: RetryPolicy,
    mut on_retry: R,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    R: FnMut(usize, Duration, &anyhow::Error),
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let transient = is_overload_error(&e);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    transient,
                    error = %e,
                    "agent call failed"
                );
                if !transient {
                    return Err(e);
                }
                if attempt >= attempts {
                    anyhow::bail!("agent call failed after {attempt} attempt(s): {e:#}");
                }
                let delay = policy.delay_after(attempt);
                on_retry(attempt, delay, &e);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
