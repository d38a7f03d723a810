//! Bootstrap utilities for relaykit binaries.

use std::future::Future;

use backon::BackoffBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::connection_backoff;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the RELAYKIT_LOG environment variable.
///
/// Defaults to "info" level if RELAYKIT_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run `connect` until it succeeds, backing off between attempts.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "broker")
/// * `address` - Address being connected to, for logging
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected value on success, or the last error once the backoff is
/// exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = connection_backoff().build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                info!(service = service_name, address, "Connected");
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        service = service_name,
                        address,
                        attempt,
                        error = %e,
                        ?delay,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(service = service_name, address, attempt, error = %e, "Connect failed, giving up");
                    return Err(e);
                }
            },
        }
    }
}
