//! Configuration-change controller.
//!
//! [`ConfigChangeController`] is an actor that owns the
//! [`ProcessSupervisor`]. Every lifecycle change funnels through it:
//! startup, configuration-driven restarts, and manual restarts. Restart
//! requests land in a [`PendingSlot`], so restart cycles never overlap
//! and a burst of changes collapses into one cycle with the newest
//! snapshot.
//!
//! For a self-supervised backend a cycle is `stop → settle → start`. For
//! an external backend it is a single `POST /reload-config` that leaves
//! the remote process running.

pub mod listener;
pub mod pending;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use pending::{PendingRestart, PendingSlot, RestartReason};

use crate::client::BackendClient;
use crate::config::ServerConfig;
use crate::supervisor::{ProcessExit, ProcessState, ProcessSupervisor, SupervisorObserver};
use crate::{AppError, Result};

/// User-facing message from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "snake_case")]
pub enum Notice {
    /// Work in progress.
    Progress(String),
    /// Something finished.
    Info(String),
    /// Degraded, but nothing to act on urgently.
    Warning(String),
    /// An operation failed.
    Error(String),
}

/// Snapshot answered by [`ControllerHandle::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Supervisor state.
    pub state: ProcessState,
    /// Backend base URL in use.
    pub url: String,
    /// Whether the backend is externally supervised.
    pub external: bool,
    /// Most recent process exit.
    pub last_exit: Option<ProcessExit>,
}

enum Command {
    Start(oneshot::Sender<Result<String>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point to the controller actor.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    pending: Arc<PendingSlot>,
    config: watch::Receiver<Arc<ServerConfig>>,
    url: watch::Receiver<String>,
    observer: SupervisorObserver,
    notices: mpsc::UnboundedSender<Notice>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start(_) => f.write_str("Start"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl ControllerHandle {
    /// Start the backend for the configuration in effect.
    ///
    /// Returns the URL the backend is reachable at.
    ///
    /// # Errors
    ///
    /// Propagates the supervisor's start error, or `AppError::Ipc` when the
    /// controller has shut down.
    pub async fn start(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .await
            .map_err(|_| controller_gone())?;
        rx.await.map_err(|_| controller_gone())?
    }

    /// Queue a restart with the configuration in effect.
    ///
    /// Returns `true` when it was merged into a restart already waiting.
    pub fn request_restart(&self) -> bool {
        self.pending.offer(PendingRestart {
            config: None,
            reason: RestartReason::Manual,
        })
    }

    /// Queue a restart for a fresh configuration snapshot.
    ///
    /// Returns `true` when it replaced a restart already waiting.
    pub fn config_changed(&self, config: Arc<ServerConfig>) -> bool {
        self.pending.offer(PendingRestart {
            config: Some(config),
            reason: RestartReason::ConfigChanged,
        })
    }

    /// Ask the backend to rebuild its agent wiring (`POST /reload`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` when the call fails.
    pub async fn reload_agent(&self) -> Result<()> {
        BackendClient::new(self.url.clone()).reload_agent().await?;
        info!("backend agent reloaded");
        Ok(())
    }

    /// Current supervisor status. Never waits on a running restart.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.observer.state(),
            url: self.url.borrow().clone(),
            external: self.config.borrow().use_external_backend,
            last_exit: self.observer.last_exit(),
        }
    }

    /// Backend base URL, updated after every cycle.
    #[must_use]
    pub fn url_receiver(&self) -> watch::Receiver<String> {
        self.url.clone()
    }

    /// Read-only supervisor view.
    #[must_use]
    pub fn observer(&self) -> &SupervisorObserver {
        &self.observer
    }

    /// Emit a notice on the controller's notice channel.
    pub fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    /// Stop the backend and end the actor.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn controller_gone() -> AppError {
    AppError::Ipc("controller is not running".into())
}

/// Actor owning the [`ProcessSupervisor`].
pub struct ConfigChangeController {
    supervisor: ProcessSupervisor,
    commands: mpsc::Receiver<Command>,
    pending: Arc<PendingSlot>,
    config_tx: watch::Sender<Arc<ServerConfig>>,
    url_tx: watch::Sender<String>,
    notices: mpsc::UnboundedSender<Notice>,
}

impl ConfigChangeController {
    /// Spawn the actor.
    ///
    /// Returns the handle, the receiver for user-facing notices, and the
    /// actor task.
    #[must_use]
    pub fn spawn(
        supervisor: ProcessSupervisor,
    ) -> (ControllerHandle, mpsc::UnboundedReceiver<Notice>, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (config_tx, config_rx) = watch::channel(Arc::clone(supervisor.config()));
        let (url_tx, url_rx) = watch::channel(supervisor.current_url());
        let pending = Arc::new(PendingSlot::new());

        let handle = ControllerHandle {
            commands: cmd_tx,
            pending: Arc::clone(&pending),
            config: config_rx,
            url: url_rx,
            observer: supervisor.observer(),
            notices: notice_tx.clone(),
        };

        let actor = Self {
            supervisor,
            commands: cmd_rx,
            pending,
            config_tx,
            url_tx,
            notices: notice_tx,
        };
        let task = tokio::spawn(actor.run().instrument(info_span!("controller")));

        (handle, notice_rx, task)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Start(reply)) => {
                        let result = self.start().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.supervisor.stop().await;
                        info!("controller shut down");
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.supervisor.stop().await;
                        return;
                    }
                },
                restart = self.pending.next() => self.cycle(restart).await,
            }
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        self.config_tx
            .send_replace(Arc::clone(self.supervisor.config()));
        self.url_tx.send_replace(self.supervisor.current_url());
    }

    async fn start(&mut self) -> Result<String> {
        if !self.supervisor.config().use_external_backend {
            self.notify(Notice::Progress("starting backend".into()));
        }
        let result = self.supervisor.start().await;
        self.publish();
        match result {
            Ok(()) => {
                let url = self.supervisor.current_url();
                self.notify(Notice::Info(format!("backend ready at {url}")));
                Ok(url)
            }
            Err(err) => {
                self.notify(error_notice("backend failed to start", &err));
                Err(err)
            }
        }
    }

    async fn cycle(&mut self, restart: PendingRestart) {
        let config = restart
            .config
            .unwrap_or_else(|| Arc::clone(self.supervisor.config()));
        let span = info_span!("restart_cycle", reason = ?restart.reason, external = config.use_external_backend);
        async {
            if config.use_external_backend {
                self.hot_reload(config).await;
            } else {
                self.full_restart(config).await;
            }
        }
        .instrument(span)
        .await;
    }

    async fn full_restart(&mut self, config: Arc<ServerConfig>) {
        self.notify(Notice::Progress("restarting backend".into()));
        let result = self.supervisor.restart(config).await;
        self.publish();
        match result {
            Ok(()) => {
                info!(url = %self.supervisor.current_url(), "restart cycle finished");
                self.notify(Notice::Info("backend restarted".into()));
            }
            Err(err) => {
                error!(%err, "restart cycle failed");
                self.notify(error_notice("backend restart failed", &err));
            }
        }
    }

    /// Apply `config` to an external backend without restarting it.
    ///
    /// A local process left over from a previous configuration is stopped
    /// first. A failed reload is reported but the new snapshot stays in
    /// effect.
    async fn hot_reload(&mut self, config: Arc<ServerConfig>) {
        if self.supervisor.pid().is_some() {
            self.notify(Notice::Progress(
                "switching to external backend; stopping local process".into(),
            ));
        }
        if let Err(err) = self.supervisor.restart(Arc::clone(&config)).await {
            // `start()` never spawns for an external backend.
            debug!(%err, "unexpected error while adopting external config");
        }
        self.publish();

        let client = BackendClient::fixed(config.base_url());
        match client.reload_config(&config.reload_payload()).await {
            Ok(reply) => {
                info!(model = %reply.model, api_base = %reply.api_base, "external backend reloaded");
                self.notify(Notice::Info(format!(
                    "external backend reloaded (model {})",
                    reply.model
                )));
            }
            Err(err) => {
                warn!(%err, "external backend reload failed");
                self.notify(Notice::Warning(err.to_string()));
            }
        }
    }
}

fn error_notice(context: &str, err: &AppError) -> Notice {
    match err.user_hint() {
        Some(hint) => Notice::Error(format!("{context}: {err}\nhint: {hint}")),
        None => Notice::Error(format!("{context}: {err}")),
    }
}
