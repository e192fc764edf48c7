//! Allow/deny gate serializing arena growth.
//!
//! Growth may move the backing store, so it must never overlap the
//! parallel tracking phase. The gate is closed by default; a growth call
//! made while it is closed, or an attempt to open an open gate (or close
//! a closed one), is an internal error and aborts.

use std::sync::atomic::{AtomicBool, Ordering};

use ember_core::{fatal, Site};

/// Runtime guard over arena growth.
#[derive(Debug, Default)]
pub struct GrowthGate {
    open: AtomicBool,
}

// Compile-time assertion: GrowthGate must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<GrowthGate>();
};

impl GrowthGate {
    /// A closed gate.
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
        }
    }

    /// Open the gate. Fatal if it is already open.
    pub fn allow(&self) {
        if self.open.swap(true, Ordering::AcqRel) {
            fatal!(Site::here("arena-gate"), "growth gate is already open");
        }
    }

    /// Close the gate. Fatal if it is already closed.
    pub fn deny(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            fatal!(Site::here("arena-gate"), "growth gate is already closed");
        }
    }

    /// Whether growth is currently permitted.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Abort unless the gate is open. Called on every allocation.
    pub(crate) fn check(&self, requested: usize) {
        if !self.is_open() {
            fatal!(
                Site::here("arena-gate"),
                "allocation of {requested} fields while growth is denied"
            );
        }
    }
}
