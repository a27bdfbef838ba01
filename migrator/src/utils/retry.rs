//! Async retry with exponential backoff

use std::time::Duration;

/// Retry an async operation with exponential backoff.
///
/// `should_retry` decides whether an error is worth another attempt.
/// Returns the value on success, or the last error together with the
/// number of attempts made.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    max_attempts: u32,
    base_delay_ms: u64,
    should_retry: P,
    mut operation: F,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts >= max_attempts || !should_retry(&e) {
                    return Err((e, attempts));
                }
                let delay = Duration::from_millis(base_delay_ms * 2_u64.pow(attempts - 1));
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Retrying after failed query"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
