//! Exponential backoff for retryable sync errors such as provisioning failures.

use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;

/// Run `op`, retrying retryable errors up to `retries` more times with
/// exponential backoff (`base`, `2 * base`, `4 * base`, ...).
pub async fn with_backoff<T, F, Fut>(retries: u32, base: Duration, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < retries => {
                let delay = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
                tracing::warn!(
                    attempt = attempt + 1,
                    retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
