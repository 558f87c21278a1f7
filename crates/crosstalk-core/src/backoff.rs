//! Reconnect backoff policies.

use rand::Rng;
use std::time::Duration;

/// Decides how long the subscriber waits before the next reconnect attempt.
pub trait BackoffPolicy: Send + Sync {
    /// Delay before attempt number `attempt` (1 for the first retry).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// The same delay before every attempt.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a fixed backoff.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Retry immediately.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// A fixed base delay plus a uniformly random extra in `[0, jitter]`.
///
/// Spreads the reconnects of servers that lost the bus at the same moment.
#[derive(Debug, Clone, Copy)]
pub struct JitteredBackoff {
    base: Duration,
    jitter: Duration,
}

impl JitteredBackoff {
    /// Create a jittered backoff.
    #[must_use]
    pub const fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }
}

impl BackoffPolicy for JitteredBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
