//! Device worker lifecycle state machine.
//!
//! `idle -> polling -> sleeping -> idle`, with sink states
//! `stopping -> stopped` reachable from any running state.

use crate::error::{EngineError, EngineResult};
use std::fmt;

/// Lifecycle state of one device worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WorkerState {
    /// Waiting for the next poll tick.
    #[default]
    Idle,
    /// Actively reading channels from the transport.
    Polling,
    /// Between the end of a cycle and the next tick deadline.
    Sleeping,
    /// Shutdown requested; finishing the in-flight cycle.
    Stopping,
    /// Terminated; no further cycles will run.
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Sleeping => "sleeping",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl WorkerState {
    /// Whether a transition to `target` is legal from the current state.
    #[must_use]
    pub fn can_transition_to(self, target: WorkerState) -> bool {
        use WorkerState::{Idle, Polling, Sleeping, Stopped, Stopping};

        matches!(
            (self, target),
            (Idle, Polling)
                | (Polling, Sleeping)
                | (Sleeping, Idle)
                // Stop can be requested from any non-terminal state.
                | (Idle, Stopping)
                | (Polling, Stopping)
                | (Sleeping, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Attempt the transition, returning [`EngineError::Internal`] if illegal.
    pub fn transition_to(&mut self, target: WorkerState) -> EngineResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(EngineError::Internal(format!(
                "illegal worker state transition from {self} to {target}"
            )))
        }
    }

    /// True once the worker will perform no further work.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}
