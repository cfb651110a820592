//! Bootstrap utilities for motobus binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the MOTOBUS_LOG environment variable.
///
/// Defaults to "info" level if MOTOBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Establish a connection with exponential backoff.
///
/// # Arguments
/// * `target` - Human-readable name for logging (e.g., "broker")
/// * `connect` - Async function that attempts to establish the connection
///
/// # Returns
/// The connection on success, or the last error after 30 attempts.
pub async fn connect_with_retry<T, E, F, Fut>(target: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30);

    let connection = connect
        .retry(backoff)
        .notify(|e: &E, delay: Duration| {
            warn!(
                target_name = %target,
                error = %e,
                backoff_ms = %delay.as_millis(),
                "Connection failed, retrying"
            );
        })
        .await?;

    info!(target_name = %target, "Connected");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_connect_with_retry_recovers() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, String> = connect_with_retry("broker", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("refused {n}"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
