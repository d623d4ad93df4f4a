//! Retry utilities: backoff for the queue poll loop.
//!
//! Uses `backon` for exponential backoff with jitter. The delay sequence is
//! consumed one step per failed receive and rebuilt after a success.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

/// Longest pause between failed receives.
pub const RECEIVE_MAX_DELAY: Duration = Duration::from_secs(20);

/// Backoff for failed queue receives.
///
/// - Min delay: 500ms
/// - Max delay: 20s
/// - Max attempts: 10 (callers keep using the max delay afterwards)
/// - Jitter enabled
pub fn receive_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(RECEIVE_MAX_DELAY)
        .with_max_times(10)
        .with_jitter()
}

/// Tracks consecutive receive failures.
pub struct ReceiveBackoff {
    delays: ExponentialBackoff,
}

impl Default for ReceiveBackoff {
    fn default() -> Self {
        Self {
            delays: receive_backoff().build(),
        }
    }
}

impl ReceiveBackoff {
    /// Delay before the next receive after a failure.
    pub fn next_delay(&mut self) -> Duration {
        self.delays.next().unwrap_or(RECEIVE_MAX_DELAY)
    }

    /// Forget earlier failures.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
