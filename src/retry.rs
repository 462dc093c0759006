//! Bounded retry for transient repository failures.
//!
//! Every attempt re-acquires the driver lock, so a retried unit observes the
//! writes of whoever won the race.

use std::future::Future;

use tracing::warn;

use crate::config::LinkingConfig;
use crate::error::LinkResult;
use crate::links::DriverLocks;

pub(crate) async fn with_driver_lock<T, F, Fut>(
    locks: &DriverLocks,
    driver_id: &str,
    config: &LinkingConfig,
    operation: &'static str,
    mut unit: F,
) -> LinkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LinkResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let result = {
            let _guard = locks.lock(driver_id).await;
            unit().await
        };

        match result {
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                warn!(
                    driver_id,
                    operation,
                    attempt,
                    error = %e,
                    "Retrying after transient repository failure"
                );
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            other => return other,
        }
    }
}
