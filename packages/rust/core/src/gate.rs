//! Single-flight gate for pipeline runs.
//!
//! Acquisition never waits: a caller that loses the race gets `None` and
//! must report "already running". The gate is released when the returned
//! [`GateGuard`] is dropped, on every exit path including unwinding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking mutual exclusion shared by every trigger path.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGate {
    held: Arc<AtomicBool>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate if it is free.
    pub fn try_acquire(&self) -> Option<GateGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                held: Arc::clone(&self.held),
            })
    }

    /// Whether a run currently holds the gate.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Proof of gate ownership; releases on drop.
#[derive(Debug)]
#[must_use = "dropping the guard releases the gate immediately"]
pub struct GateGuard {
    held: Arc<AtomicBool>,
}

impl GateGuard {
    /// Release the gate now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
