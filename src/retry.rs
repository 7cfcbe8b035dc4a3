use std::future::Future;
use std::time::Duration;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Fixed-delay retry budget. Transient failures on a chat transport are
/// mostly rate limits and expiring media handles, which a short constant
/// pause rides out as well as any backoff curve would.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts per item, including the first one.
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 5,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Final result of a retried operation together with how many attempts it
/// took to get there.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Retry an async operation with a fixed pause between attempts.
///
/// - `config`: attempt budget and delay
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: called with the 1-based attempt number
///
/// Stops at the first `Ok`, at the first error the classifier aborts on, or
/// when the attempt budget is spent; the last error is returned in the two
/// failure cases.
pub async fn retry_with_delay<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(val) => {
                return RetryOutcome {
                    result: Ok(val),
                    attempts: attempt,
                }
            }
            Err(e) => {
                if classifier(&e) == RetryAction::Abort || attempt >= total_attempts {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {}s: {}",
                    attempt,
                    total_attempts,
                    config.delay_secs,
                    e
                );
                tokio::time::sleep(config.delay()).await;
                attempt += 1;
            }
        }
    }
}
