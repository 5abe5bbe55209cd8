//! Cooperative cancellation, checked at the same granularity `ProgressBars` is
//! threaded through every phase loop (§5 `ProgressRendezvous`).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation check, polled between items within a phase and
/// between phases. Reconciliation phases are not interrupted mid-item; a
/// cancellation observed mid-phase is honored at the next item boundary.
pub trait Cancellation: Send + Sync + 'static {
    /// `true` once cancellation has been requested.
    fn is_cancelled(&self) -> bool;
}

/// A `Cancellation` that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A shared, settable cancellation flag, for callers that need to cancel a
/// running repair from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// A fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Cancellation for CancellationFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_uncancelled_and_latches() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
    }
}
