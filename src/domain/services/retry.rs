/// Bounded retry with exponential backoff for exchange gateway calls
///
/// Every attempt runs under a timeout; an attempt that exceeds it counts as a
/// transient failure. Fatal errors are returned immediately, transient ones are
/// retried until `max_attempts` is reached.
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::domain::errors::GatewayError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay
    pub max_backoff: Duration,
    /// Timeout applied to each attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    attempts: u32,
    current_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            attempts: 0,
            current_delay: initial_delay,
        }
    }

    /// Delay to wait now; doubles the next one, capped
    fn next_delay(&mut self, max_delay: Duration) -> Duration {
        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.current_delay * 2, max_delay);
        delay
    }
}

/// Run `call` until it succeeds, fails fatally, or attempts run out.
///
/// # Arguments
/// * `operation` - Name of the call for logging purposes
/// * `policy` - Attempt limit, backoff and per-attempt timeout
/// * `call` - Produces one attempt; invoked again for every retry
///
/// # Errors
/// The fatal (or otherwise non-transient) error as returned, or
/// `GatewayError::RetriesExhausted` wrapping the last transient error.
pub async fn call_with_retry<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut state = BackoffState::new(policy.initial_backoff);

    loop {
        state.attempts += 1;

        let outcome = match timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(policy.call_timeout)),
        };

        match outcome {
            Ok(value) => {
                if state.attempts > 1 {
                    debug!(
                        "'{}' succeeded after {} attempts",
                        operation, state.attempts
                    );
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if state.attempts >= max_attempts => {
                warn!(
                    "'{}' failed after {} attempts: {}",
                    operation, state.attempts, e
                );
                return Err(GatewayError::RetriesExhausted {
                    attempts: state.attempts,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = state.next_delay(policy.max_backoff);
                warn!(
                    "'{}' failed (attempt {}/{}): {}; retrying in {:?}",
                    operation, state.attempts, max_attempts, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
