use std::future::Future;
use std::time::Duration;

use crate::error::ProviderError;

/// Retry policy for provider calls: total attempt cap and base delay for
/// exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Retry a fallible async provider operation with exponential backoff.
///
/// Only transient failures are retried; a terminal failure is returned
/// immediately, and a transient failure on the final attempt is surfaced
/// as-is for the caller to treat as terminal for the node.
pub async fn with_retry<F, Fut, T>(
    policy: RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                // Exponent capped so an oversized attempt budget cannot
                // overflow the multiplier.
                let delay = policy.base_delay * 2u32.pow((attempt - 1).min(16));
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        "retry attempts exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}
