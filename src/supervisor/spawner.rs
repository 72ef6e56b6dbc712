//! Backend process spawner and exit monitor.
//!
//! Spawns the backend with:
//! - `kill_on_drop(true)` so the process never outlives its handle.
//! - `env_clear()` + a small allowlist, then the variables derived from
//!   the current [`ServerConfig`]; nothing else from the host leaks in.
//! - stdout/stderr forwarded line by line to the diagnostics sink.
//!
//! A monitor task owns the [`tokio::process::Child`] and records the exit
//! exactly once. The supervisor talks to it only through
//! [`RunningProcess`].

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{info, warn};

use super::state::StateCell;
use crate::config::ServerConfig;
use crate::{AppError, Result};

/// Environment variables inherited by the backend process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Which output pipe a diagnostic line came from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of backend output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticLine {
    /// Backend process id.
    pub pid: u32,
    /// Source pipe.
    pub stream: OutputStream,
    /// Line content without the trailing newline.
    pub line: String,
}

/// Record of a backend process exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// Process id of the exited backend.
    pub pid: u32,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// When the exit was observed.
    pub exited_at: DateTime<Utc>,
}

/// Supervisor-side handle to a live backend process.
#[derive(Debug)]
pub(crate) struct RunningProcess {
    pub(crate) pid: u32,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl RunningProcess {
    /// Whether the monitor has already observed the exit.
    pub(crate) fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// A fresh receiver for the exit record.
    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Ask the monitor to kill the process immediately.
    pub(crate) fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait until the process has exited.
    pub(crate) async fn wait_exit(&mut self) -> Option<ProcessExit> {
        wait_for_exit(&mut self.exit_rx).await
    }
}

/// Wait on an exit watch until it carries a record.
pub(crate) async fn wait_for_exit(
    exit_rx: &mut watch::Receiver<Option<ProcessExit>>,
) -> Option<ProcessExit> {
    match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => exit.clone(),
        // Monitor dropped without recording; the child is gone with it.
        Err(_) => None,
    }
}

/// Spawn the backend executable for `config`.
///
/// # Errors
///
/// Returns `AppError::Spawn` when the OS refuses to start the process or
/// its pid is unavailable.
pub(crate) fn spawn_backend(
    executable: &Path,
    config: &ServerConfig,
    state: Arc<StateCell>,
    diagnostics: broadcast::Sender<DiagnosticLine>,
    last_exit: watch::Sender<Option<ProcessExit>>,
) -> Result<RunningProcess> {
    let mut cmd = Command::new(executable);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    for (key, value) in config.process_env() {
        cmd.env(key, value);
    }

    if let Some(dir) = executable.parent().filter(|p| p != &Path::new("")) {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn backend: {err}")))?;

    let Some(pid) = child.id() else {
        return Err(AppError::Spawn("backend exited before reporting a pid".into()));
    };

    info!(pid, executable = %executable.display(), "backend process spawned");

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(pid, OutputStream::Stdout, stdout, diagnostics.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(pid, OutputStream::Stderr, stderr, diagnostics));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(monitor_exit(pid, child, kill_rx, exit_tx, last_exit, state));

    Ok(RunningProcess {
        pid,
        exit_rx,
        kill_tx: Some(kill_tx),
    })
}

/// Forward each output line to tracing and to diagnostics subscribers.
async fn forward_output<R>(
    pid: u32,
    stream: OutputStream,
    pipe: R,
    diagnostics: broadcast::Sender<DiagnosticLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(target: "backend", pid, ?stream, "{line}");
                let _ = diagnostics.send(DiagnosticLine { pid, stream, line });
            }
            Ok(None) => break,
            Err(err) => {
                warn!(pid, ?stream, %err, "failed to read backend output");
                break;
            }
        }
    }
}

/// Own the child until it exits, then record the exit once.
///
/// An exit observed while the state is still `Healthy` was not requested
/// by anyone: it is logged and the state is reaped to `Stopped`. There is
/// no automatic restart.
async fn monitor_exit(
    pid: u32,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    last_exit: watch::Sender<Option<ProcessExit>>,
    state: Arc<StateCell>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // A dropped handle counts as a kill request.
        _ = kill_rx => {
            warn!(pid, "force-killing backend process");
            if let Err(err) = child.start_kill() {
                warn!(pid, %err, "failed to force-kill backend process");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(pid, %err, "error waiting for backend process");
            None
        }
    };

    let exit = ProcessExit {
        pid,
        code,
        exited_at: Utc::now(),
    };
    // Publish before reaping: a supervisor that moves to `Healthy` after
    // this point sees the exit, one that moved before it gets reaped here.
    exit_tx.send_replace(Some(exit.clone()));
    last_exit.send_replace(Some(exit));

    if state.reap_if_healthy() {
        warn!(pid, ?code, "backend process exited unexpectedly; not restarting");
    } else {
        info!(pid, ?code, "backend process exited");
    }
}
