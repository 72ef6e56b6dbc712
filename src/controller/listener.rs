//! Bridges config file changes to the controller.
//!
//! Changes outside the backend namespace are dropped here. Relevant ones
//! reload the file, derive a new [`ServerConfig`](crate::config::ServerConfig)
//! snapshot, and queue it on the controller's pending slot.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ControllerHandle, Notice};
use crate::config::load_server_config;
use crate::config_watcher::ConfigChange;

/// Spawn the listener task.
///
/// `workspace_override` is re-applied to every reload so a `--workspace`
/// flag keeps precedence over the file.
#[must_use]
pub fn spawn_config_listener(
    config_path: PathBuf,
    workspace_override: Option<PathBuf>,
    mut changes: mpsc::UnboundedReceiver<ConfigChange>,
    controller: ControllerHandle,
    ct: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                let change = tokio::select! {
                    () = ct.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };

                if !change.affects_backend() {
                    debug!(sections = ?change.sections, "config change outside backend namespace; ignored");
                    continue;
                }

                match load_server_config(&config_path, workspace_override.as_deref()).await {
                    Ok((_, snapshot)) => {
                        let coalesced = controller.config_changed(Arc::new(snapshot));
                        info!(sections = ?change.sections, coalesced, "backend configuration changed");
                    }
                    Err(err) => {
                        warn!(%err, "ignoring invalid configuration change");
                        controller.notify(Notice::Warning(format!(
                            "configuration change ignored: {err}"
                        )));
                    }
                }
            }
            debug!("config listener stopped");
        }
        .instrument(info_span!("config_listener")),
    )
}
