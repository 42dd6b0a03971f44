//! Single-slot gate arbitrating commits against checkouts
//!
//! The debounce path and the remote-trigger path both mutate the working
//! tree. Neither is allowed to wait for the other: acquisition is always
//! non-blocking, and a busy gate is reported to whoever asked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Binary resource with capacity 1, shared by cloning
///
/// All clones refer to the same slot.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    held: Arc<AtomicBool>,
}

impl Gate {
    /// Create a new, free gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the slot without blocking
    ///
    /// Returns false if someone else holds it.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give the slot back
    ///
    /// Must only be called by the current holder.
    pub fn release(&self) {
        let was_held = self.held.swap(false, Ordering::AcqRel);
        debug_assert!(was_held, "released a gate that was not held");
    }

    /// Try to take the slot, returning a guard that releases it on drop
    pub fn try_guard(&self) -> Option<GateGuard> {
        if self.try_acquire() {
            Some(GateGuard { gate: self.clone() })
        } else {
            None
        }
    }

    /// Whether the slot is currently taken
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Holds a [`Gate`] until dropped
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard {
    gate: Gate,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}
