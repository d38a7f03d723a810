//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Upper bound for a single rejoin delay.
pub const REJOIN_MAX_DELAY: Duration = Duration::from_secs(5);

/// Backoff between consumer-group rejoins.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 20, after which callers keep waiting `REJOIN_MAX_DELAY`
/// - Jitter enabled
pub fn rejoin_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(REJOIN_MAX_DELAY)
        .with_max_times(20)
        .with_jitter()
}

/// Backoff for connecting to the transport at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
