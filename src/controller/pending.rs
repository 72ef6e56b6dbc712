//! Single-slot pending-restart queue.
//!
//! At most one restart waits at a time. A new request replaces the waiting
//! one, so a burst of configuration changes collapses into a single cycle
//! carrying the newest snapshot.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;

use crate::config::ServerConfig;

/// Why a restart was requested.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// The configuration file changed.
    ConfigChanged,
    /// Someone asked for it (`/restart`, `agent-tether-ctl restart`).
    Manual,
}

/// A restart waiting to run.
#[derive(Debug, Clone)]
pub struct PendingRestart {
    /// Snapshot to start with; `None` keeps the one in effect.
    pub config: Option<Arc<ServerConfig>>,
    /// Origin of the request.
    pub reason: RestartReason,
}

/// Holder for the next restart.
#[derive(Debug, Default)]
pub struct PendingSlot {
    slot: Mutex<Option<PendingRestart>>,
    ready: Notify,
}

impl PendingSlot {
    /// Empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `restart` in the slot, replacing whatever waits there.
    ///
    /// A request without a snapshot keeps the snapshot of the request it
    /// replaces. Returns `true` when an earlier request was coalesced.
    pub fn offer(&self, mut restart: PendingRestart) -> bool {
        let replaced = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = slot.take();
            if restart.config.is_none() {
                restart.config = previous.as_ref().and_then(|p| p.config.clone());
            }
            *slot = Some(restart);
            previous.is_some()
        };
        self.ready.notify_one();
        replaced
    }

    /// Take the waiting restart, if any.
    pub fn take(&self) -> Option<PendingRestart> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for the next restart and take it.
    pub async fn next(&self) -> PendingRestart {
        loop {
            if let Some(restart) = self.take() {
                return restart;
            }
            self.ready.notified().await;
        }
    }
}
