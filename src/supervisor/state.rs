//! Backend process state machine.
//!
//! Legal transitions:
//!
//! ```text
//! Stopped ──► Starting ──► Healthy ──► Stopping ──► Stopped
//!                │                                     ▲
//!                └─────────── failure / timeout ───────┘
//! ```
//!
//! Every accepted transition is broadcast so observers (the controller,
//! tests, the IPC status command) can follow the lifecycle.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Lifecycle state of the supervised backend process.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// No process is running.
    #[default]
    Stopped,
    /// Process spawned; waiting for the liveness probe.
    Starting,
    /// Process answered its liveness probe.
    Healthy,
    /// Termination in progress.
    Stopping,
}

impl ProcessState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Stopped, Self::Starting)
                | (Self::Starting, Self::Healthy | Self::Stopped)
                | (Self::Healthy, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

/// Single owner of the current [`ProcessState`].
///
/// Shared between the supervisor and its exit-monitor task; the mutex
/// makes check-and-set atomic so the two never both claim a transition.
#[derive(Debug)]
pub(crate) struct StateCell {
    current: Mutex<ProcessState>,
    transitions: broadcast::Sender<ProcessState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            current: Mutex::new(ProcessState::Stopped),
            transitions,
        }
    }

    pub(crate) fn get(&self) -> ProcessState {
        *self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProcessState> {
        self.transitions.subscribe()
    }

    /// Move to `next` if legal. Returns whether the transition happened.
    pub(crate) fn advance(&self, next: ProcessState) -> bool {
        let mut guard = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.apply(&mut guard, next)
    }

    /// Reap a process that died while `Healthy`.
    ///
    /// Walks `Healthy → Stopping → Stopped` under one lock. Does nothing in
    /// any other state: `Starting` is handled by the health wait and
    /// `Stopping` by `stop()`.
    pub(crate) fn reap_if_healthy(&self) -> bool {
        let mut guard = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *guard != ProcessState::Healthy {
            return false;
        }
        self.apply(&mut guard, ProcessState::Stopping);
        self.apply(&mut guard, ProcessState::Stopped);
        true
    }

    fn apply(&self, current: &mut ProcessState, next: ProcessState) -> bool {
        if !current.can_transition_to(next) {
            debug!(from = ?*current, to = ?next, "ignoring illegal process state transition");
            return false;
        }
        info!(from = ?*current, to = ?next, "backend process state changed");
        *current = next;
        // No subscribers is fine.
        let _ = self.transitions.send(next);
        true
    }
}
