//! Retry utilities: backoff builders for the pipeline's retry points.
//!
//! Uses `backon` for the jittered retry loops. The nack visibility delay is
//! a pure function of the receive count and is computed directly.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for reconnecting to an unavailable change log.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Unbounded attempts; the caller's shutdown signal ends the loop
pub fn source_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Backoff for enqueueing to a destination that refused a message.
///
/// - Min delay: 10ms
/// - Max delay: 1s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn enqueue_backoff(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Backoff for re-running a failed change-log batch on the stream path.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn stream_batch_backoff(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Delay before a nacked message becomes visible again.
///
/// The first failed delivery waits `min`, each further one doubles it, capped
/// at `max`. Computed on integer durations so the steps are exact.
pub fn nack_delay(receive_count: u32, min: Duration, max: Duration) -> Duration {
    let doublings = receive_count.saturating_sub(1).min(31);
    min.saturating_mul(1u32 << doublings).min(max)
}
