//! Alternation gate for incoming signals.

use tracing::{debug, info};

use crate::models::{Direction, Signal};

/// Suppresses a signal whose direction matches the last accepted one.
#[derive(Debug, Default)]
pub struct SignalFilter {
    last_accepted: Option<Direction>,
}

impl SignalFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the signal if its direction differs from the last accepted
    /// direction (or nothing has been accepted yet). Only an accepted signal
    /// changes state.
    pub fn should_process(&mut self, signal: &Signal) -> bool {
        match self.last_accepted {
            None => {
                info!(signal = %signal, "First signal accepted");
                self.last_accepted = Some(signal.direction);
                true
            }
            Some(last) if last == signal.direction => {
                debug!(signal = %signal, last = %last, "Duplicate signal ignored");
                false
            }
            Some(last) => {
                info!(signal = %signal, previous = %last, "Alternating signal accepted");
                self.last_accepted = Some(signal.direction);
                true
            }
        }
    }

    pub fn last_accepted(&self) -> Option<Direction> {
        self.last_accepted
    }
}
