//! Retry with an exponentially growing delay.
//!
//! Every failing attempt doubles the wait; once the next wait would exceed
//! the give-up ceiling the last error propagates. Both the network layer and
//! the server-failure layer of the pipeline run on this utility, with
//! different retryability predicates.

use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Delay schedule for [`retry_with_backoff`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    first_delay: Duration,
    give_up_after: Duration,
}

impl BackoffPolicy {
    /// 1 second first delay, doubling, giving up past 30 minutes.
    pub const fn standard() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            give_up_after: Duration::from_secs(30 * 60),
        }
    }

    pub fn first_delay(mut self, first_delay: Duration) -> Self {
        self.first_delay = first_delay.max(Duration::from_millis(1));
        self
    }

    /// Ceiling on a single delay; a retry whose delay would exceed it is not
    /// attempted and the error propagates instead.
    pub fn give_up_after(mut self, give_up_after: Duration) -> Self {
        self.give_up_after = give_up_after;
        self
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Retries `operation` on any rejection until the policy gives up.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: BackoffPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(policy, operation, |_| true).await
}

/// Retries `operation` while `is_retryable` accepts the rejection; a refused
/// rejection propagates immediately without sleeping.
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    policy: BackoffPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut wait = policy.first_delay;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_retryable(&error) || wait > policy.give_up_after {
                    return Err(error);
                }
                warn!(delay_ms = wait.as_millis() as u64, error = %error, "retrying after failure");
                sleep(wait).await;
                wait = wait.saturating_mul(2);
            }
        }
    }
}
