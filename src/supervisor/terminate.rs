//! Graceful termination requests for the backend process.
//!
//! On Unix the process receives `SIGTERM`. On Windows there is no reliable
//! graceful signal for a console child, so the whole process tree is
//! killed with `taskkill /T /F`.

use tracing::debug;

use crate::Result;

/// Ask process `pid` to exit.
///
/// A process that is already gone is not an error.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal could not be delivered.
#[cfg(unix)]
#[allow(clippy::unused_async)] // Uniform async signature across platforms.
pub async fn request_graceful(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| crate::AppError::Io(format!("pid {pid} out of range")))?;

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => {
            debug!(pid, "sent SIGTERM to backend");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pid, "backend already exited before SIGTERM");
            Ok(())
        }
        Err(err) => Err(crate::AppError::Io(format!(
            "failed to signal backend process {pid}: {err}"
        ))),
    }
}

/// Kill the process tree rooted at `pid`.
///
/// # Errors
///
/// Returns `AppError::Io` if `taskkill` cannot be run.
#[cfg(windows)]
pub async fn request_graceful(pid: u32) -> Result<()> {
    let status = tokio::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|err| crate::AppError::Io(format!("failed to run taskkill: {err}")))?;
    debug!(pid, ?status, "taskkill finished");
    Ok(())
}
