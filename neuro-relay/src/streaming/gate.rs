//! Open/closed gate with bounded waits
//!
//! Used by the subscriber client: the receiver worker only reads while the
//! gate is open (at least one active watch) and parks on it otherwise.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct WatchGate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl WatchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or close the gate, waking every waiter
    pub fn set(&self, open: bool) {
        let mut state = self.open.lock();
        if *state != open {
            *state = open;
            self.changed.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Wait until the gate is open or `timeout` elapses
    ///
    /// Returns whether the gate is open on return.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let mut state = self.open.lock();
        if !*state {
            self.changed.wait_while_for(&mut state, |open| !*open, timeout);
        }
        *state
    }
}
