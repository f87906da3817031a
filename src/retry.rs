use std::future::Future;

use crate::config::BackoffConfig;

/// Run `op` until it succeeds, the error is not retryable, or
/// `backoff.max_attempts` tries have been made. On failure returns the
/// number of tries and the last error.
pub async fn with_backoff<T, E, F, Fut>(
    backoff: &BackoffConfig,
    operation: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, (u32, E)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&e) {
                    return Err((attempt, e));
                }
                let delay = backoff.delay_for(attempt - 1);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
