//! Process-wide cancellation flag.
//!
//! One atomic boolean shared by every worker: collectors poll it between
//! sleep slices, the writer between drains, the watchdog between ticks.
//! The flag is passed explicitly instead of living in a global so tests can
//! run several engines side by side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative shutdown signal. Cloning is cheap and shares the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag. Idempotent; there is no way to un-cancel.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    /// The raw atomic, for signal-handler registration.
    pub fn as_atomic(&self) -> Arc<AtomicBool> {
        self.inner.clone()
    }
}
