//! Per-worker latch that suppresses parameter pulls during a local update.
//!
//! The gate is owned by one worker and handed by reference to the code that
//! checks it. It is deliberately `!Sync`: two workers never share a gate.
//!
//! # Latch semantics
//!
//! The latch does not count. Any number of `on()` calls are undone by a single
//! `off()`, so an inner [`GateGuard`] dropped inside an outer one reopens the
//! gate early. Bracket each update with exactly one guard.

use std::cell::Cell;

/// Re-entrant boolean latch. `get() == true` means sync is disabled.
#[derive(Debug, Default)]
pub struct SyncGate {
    disabled: Cell<bool>,
}

impl SyncGate {
    /// Create an open gate (sync enabled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable sync. Idempotent.
    pub fn on(&self) {
        self.disabled.set(true);
    }

    /// Re-enable sync. Idempotent.
    pub fn off(&self) {
        self.disabled.set(false);
    }

    /// Whether sync is currently disabled.
    pub fn get(&self) -> bool {
        self.disabled.get()
    }

    /// Whether pulls are currently allowed.
    pub fn is_open(&self) -> bool {
        !self.get()
    }

    /// Disable sync until the returned guard is dropped.
    ///
    /// The guard reopens the gate on every exit path, unwinding included.
    pub fn close(&self) -> GateGuard<'_> {
        self.on();
        GateGuard { gate: self }
    }
}

/// Keeps a [`SyncGate`] closed while alive.
#[must_use = "the gate reopens as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a SyncGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.off();
    }
}
