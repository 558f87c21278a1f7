//! Lifecycle flags shared between a broker and its background tasks.

use std::sync::atomic::{AtomicBool, Ordering};

/// `started` / `connected` flags.
///
/// Both flags are read without locking. `connected` may be stale-true for a
/// moment after a stop; [`is_connected`](Self::is_connected) masks it with
/// `started`, so observers never see connected without started.
#[derive(Debug, Default)]
pub struct BrokerState {
    started: AtomicBool,
    connected: AtomicBool,
}

impl BrokerState {
    /// Create a stopped, disconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the broker is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Check if the broker is started and its transport is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.is_started() && self.connected.load(Ordering::Acquire)
    }

    /// Mark the broker started.
    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Claim the start transition.
    ///
    /// Returns `false` if the broker was already started.
    pub(crate) fn claim_start(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the stop transition.
    ///
    /// Returns `true` for exactly one caller per start; everyone else must
    /// treat stop as a no-op.
    pub(crate) fn claim_stop(&self) -> bool {
        self.started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record whether the transport is live.
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}
