//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use tokio::task::spawn_blocking;

use crate::{clog_debug, Error, Result};

/// Run blocking filesystem work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Retry a fallible async operation with exponential backoff.
///
/// `attempts` is the total number of tries, so `attempts = 1` means no retry.
/// The last error is returned once every attempt has failed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    label: &str,
    attempts: u32,
    base: Duration,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < attempts => {
                let delay = backoff_delay(base, attempt, Duration::from_secs(60));
                clog_debug!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    label,
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
