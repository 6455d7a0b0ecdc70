use snapshot_config::shared::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::SnapshotResult;

/// Spreads a delay over `[delay / 2, delay]` so instances retrying together do not stay in step.
fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 2 {
        return delay;
    }

    Duration::from_millis(rand::random_range(millis / 2..=millis))
}

/// Runs `operation` until it succeeds, fails with a non-transient error or uses up
/// `config.max_attempts`.
///
/// Failed attempts are separated by an exponential, jittered backoff.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    description: &str,
    mut operation: F,
) -> SnapshotResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SnapshotResult<T>>,
{
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry + 1 < config.max_attempts => {
                let delay = with_jitter(config.delay_for(retry));
                warn!(
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "{description} failed, retrying"
                );

                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
