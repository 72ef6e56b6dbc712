//! Backend process supervision.
//!
//! [`ProcessSupervisor`] is the single owner of the backend process and
//! its [`ProcessState`]. Other components only see the four lifecycle
//! operations ([`start`](ProcessSupervisor::start),
//! [`stop`](ProcessSupervisor::stop),
//! [`restart`](ProcessSupervisor::restart),
//! [`current_url`](ProcessSupervisor::current_url)) plus read-only
//! observation channels.

pub mod executable;
pub mod health;
pub mod spawner;
pub mod state;
pub mod terminate;

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, info_span, warn, Instrument};

pub use health::{HealthProbe, HttpHealthProbe};
pub use spawner::{DiagnosticLine, OutputStream, ProcessExit};
pub use state::ProcessState;

use crate::config::ServerConfig;
use crate::{AppError, Result};
use spawner::RunningProcess;
use state::StateCell;

/// Owns the backend process lifecycle.
///
/// Methods take `&mut self`: the owner (normally the controller actor)
/// serializes every lifecycle call, so two spawns can never overlap.
pub struct ProcessSupervisor {
    config: Arc<ServerConfig>,
    probe: Arc<dyn HealthProbe>,
    state: Arc<StateCell>,
    process: Option<RunningProcess>,
    diagnostics: broadcast::Sender<DiagnosticLine>,
    last_exit: watch::Sender<Option<ProcessExit>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state.get())
            .field("pid", &self.process.as_ref().map(|p| p.pid))
            .field("url", &self.config.base_url())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Supervisor probing `GET /health` over HTTP.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self::with_probe(config, Arc::new(HttpHealthProbe::default()))
    }

    /// Supervisor with a custom liveness probe.
    #[must_use]
    pub fn with_probe(config: Arc<ServerConfig>, probe: Arc<dyn HealthProbe>) -> Self {
        let (diagnostics, _) = broadcast::channel(256);
        let (last_exit, _) = watch::channel(None);
        Self {
            config,
            probe,
            state: Arc::new(StateCell::new()),
            process: None,
            diagnostics,
            last_exit,
        }
    }

    /// Start the backend and wait until it is healthy.
    ///
    /// A no-op for an external backend or when a process is already alive.
    ///
    /// # Errors
    ///
    /// - `AppError::ExecutableNotFound` when no executable exists; the
    ///   state stays `Stopped`.
    /// - `AppError::Spawn` when the OS refuses to start the process.
    /// - `AppError::HealthTimeout` when the liveness budget runs out; the
    ///   process is killed and the state returns to `Stopped`.
    /// - `AppError::ProcessExited` when the process dies during startup.
    pub async fn start(&mut self) -> Result<()> {
        if self.config.use_external_backend {
            info!(url = %self.config.base_url(), "external backend configured; not spawning");
            return Ok(());
        }
        if let Some(process) = &self.process {
            if !process.has_exited() {
                info!(pid = process.pid, "backend already running");
                return Ok(());
            }
            self.process = None;
        }

        let span = info_span!("supervisor_start", port = self.config.port);
        self.start_local().instrument(span).await
    }

    async fn start_local(&mut self) -> Result<()> {
        let executable = executable::resolve(
            &self.config.supervision.resource_dir,
            self.config.executable.as_deref(),
        )?;

        if !self.state.advance(ProcessState::Starting) {
            return Err(AppError::Spawn(format!(
                "cannot start backend while {:?}",
                self.state.get()
            )));
        }

        let mut process = match spawner::spawn_backend(
            &executable,
            &self.config,
            Arc::clone(&self.state),
            self.diagnostics.clone(),
            self.last_exit.clone(),
        ) {
            Ok(process) => process,
            Err(err) => {
                self.state.advance(ProcessState::Stopped);
                return Err(err);
            }
        };

        let base_url = self.config.base_url();
        let mut exit_rx = process.exit_watch();
        let outcome = tokio::select! {
            healthy = health::wait_until_healthy(
                self.probe.as_ref(),
                &base_url,
                self.config.supervision.poll_interval,
                self.config.supervision.health_timeout,
            ) => healthy.map(|_| ()),
            exit = spawner::wait_for_exit(&mut exit_rx) => Err(AppError::ProcessExited(
                match exit.and_then(|e| e.code) {
                    Some(code) => format!("backend exited during startup with code {code}"),
                    None => "backend exited during startup".into(),
                },
            )),
        };

        if let Err(err) = outcome {
            warn!(pid = process.pid, %err, "backend failed to start");
            process.force_kill();
            process.wait_exit().await;
            self.state.advance(ProcessState::Stopped);
            return Err(err);
        }

        self.state.advance(ProcessState::Healthy);
        if process.has_exited() {
            self.state.reap_if_healthy();
            return Err(AppError::ProcessExited(
                "backend exited right after becoming healthy".into(),
            ));
        }

        info!(pid = process.pid, url = %base_url, "backend healthy");
        self.process = Some(process);
        Ok(())
    }

    /// Stop the backend, escalating to a forced kill after the grace period.
    ///
    /// A no-op when nothing is running. Always settles in `Stopped`.
    pub async fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if process.has_exited() {
            return;
        }

        let pid = process.pid;
        let grace = self.config.supervision.stop_grace;
        let state = Arc::clone(&self.state);

        async move {
            state.advance(ProcessState::Stopping);

            if let Err(err) = terminate::request_graceful(pid).await {
                warn!(pid, %err, "graceful termination failed; killing");
                process.force_kill();
            }

            if tokio::time::timeout(grace, process.wait_exit()).await.is_err() {
                warn!(pid, grace_ms = grace.as_millis(), "backend ignored termination; killing");
                process.force_kill();
                process.wait_exit().await;
            }

            state.advance(ProcessState::Stopped);
            info!(pid, "backend stopped");
        }
        .instrument(info_span!("supervisor_stop", pid))
        .await;
    }

    /// Stop, let the port settle, adopt `config`, then start again.
    ///
    /// The outgoing snapshot's grace and settle delays apply to the stop;
    /// `config.supervision` governs the new start.
    ///
    /// # Errors
    ///
    /// Propagates any error from [`start`](Self::start).
    pub async fn restart(&mut self, config: Arc<ServerConfig>) -> Result<()> {
        let had_process = self.process.is_some();
        self.stop().await;
        if had_process {
            tokio::time::sleep(self.config.supervision.restart_settle).await;
        }
        self.config = config;
        self.start().await
    }

    /// Reachable base URL of the backend.
    #[must_use]
    pub fn current_url(&self) -> String {
        self.config.base_url()
    }

    /// Configuration snapshot currently in effect.
    #[must_use]
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    /// Pid of the running backend, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .filter(|p| !p.has_exited())
            .map(|p| p.pid)
    }

    /// Receive every accepted state transition.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Receive backend stdout/stderr lines.
    #[must_use]
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticLine> {
        self.diagnostics.subscribe()
    }

    /// Most recent backend exit, expected or not.
    #[must_use]
    pub fn last_exit(&self) -> Option<ProcessExit> {
        self.last_exit.borrow().clone()
    }

    /// Read-only view that stays valid while the supervisor is busy.
    #[must_use]
    pub fn observer(&self) -> SupervisorObserver {
        SupervisorObserver {
            state: Arc::clone(&self.state),
            last_exit: self.last_exit.subscribe(),
        }
    }
}

/// Cheap, cloneable read access to supervisor state.
///
/// Lets status queries answer without waiting for the owner of the
/// [`ProcessSupervisor`] to finish a restart.
#[derive(Debug, Clone)]
pub struct SupervisorObserver {
    state: Arc<StateCell>,
    last_exit: watch::Receiver<Option<ProcessExit>>,
}

impl SupervisorObserver {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    /// Receive every accepted state transition.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Most recent backend exit.
    #[must_use]
    pub fn last_exit(&self) -> Option<ProcessExit> {
        self.last_exit.borrow().clone()
    }
}
