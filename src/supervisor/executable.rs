//! Platform-specific backend executable resolution.

use std::path::{Path, PathBuf};

use crate::{AppError, Result};

/// File name of the bundled backend for the current platform.
#[must_use]
pub fn platform_executable_name() -> &'static str {
    if cfg!(windows) {
        "backend-win.exe"
    } else if cfg!(target_os = "macos") {
        "backend-darwin"
    } else {
        "backend-linux"
    }
}

/// Locate the backend executable.
///
/// An explicit `override_path` wins; otherwise the platform name is looked
/// up inside `resource_dir`.
///
/// # Errors
///
/// Returns `AppError::ExecutableNotFound` naming the path that was tried
/// when no regular file exists there.
pub fn resolve(resource_dir: &Path, override_path: Option<&Path>) -> Result<PathBuf> {
    let candidate = override_path.map_or_else(
        || resource_dir.join(platform_executable_name()),
        Path::to_path_buf,
    );

    if candidate.is_file() {
        Ok(candidate)
    } else {
        Err(AppError::ExecutableNotFound(
            candidate.display().to_string(),
        ))
    }
}
