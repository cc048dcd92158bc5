use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::GatewayError;

/// Bounded retry for order gateway calls
///
/// Each attempt runs under `timeout`; an elapsed timeout counts as a
/// transient failure, never as success. Backoff doubles from
/// `base_backoff` up to `max_backoff` with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let full = self.backoff(attempt);
        let millis = full.as_millis() as u64;
        if millis < 2 {
            return full;
        }
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    /// Run `op` until it succeeds, fails terminally or attempts run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(self.timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempts", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.jittered(attempt);
                    tracing::warn!(
                        "Attempt {}/{} failed for {}: {}. Retrying in {}ms...",
                        attempt,
                        max_attempts,
                        label,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
