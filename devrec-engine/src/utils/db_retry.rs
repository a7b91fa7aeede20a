//! Database Retry Logic
//!
//! Exponential backoff for transient SQLite "database is locked" errors.
//! Any other error is returned immediately.

use std::time::{Duration, Instant};

use crate::error::{ReconError, ReconResult};

/// Default upper bound on total time spent retrying one operation
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Retry a database operation with exponential backoff until `max_wait_ms` elapses.
///
/// **Backoff Strategy:**
/// - Initial delay: 10ms
/// - Max delay: 1000ms
/// - Multiplier: 2.0
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> ReconResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ReconResult<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_lock_error(&err) {
                    return Err(err);
                }

                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        "Database operation failed: max retry time exceeded"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, will retry after backoff"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
        }
    }
}

fn is_lock_error(err: &ReconError) -> bool {
    match err {
        ReconError::Common(common) => common.is_database_locked(),
        _ => false,
    }
}
