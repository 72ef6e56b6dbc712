//! File watcher that turns edits of `config.toml` into [`ConfigChange`]s.
//!
//! [`ConfigWatcher`] uses the `notify` crate to watch the directory that
//! contains the config file. On every create/modify/remove event touching
//! the file it re-reads the raw TOML table, diffs it against the last seen
//! table, and emits the set of changed top-level keys. It does not
//! validate the file; the consumer re-parses the full configuration.
//!
//! ## Thread safety
//!
//! The last-seen table lives behind a `std::sync::Mutex` because it is
//! touched from inside the synchronous `notify` callback.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CONFIG_NAMESPACE, NAMESPACE_ADJACENT_KEYS};
use crate::{AppError, Result};

/// A batch of top-level configuration keys whose values changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChange {
    /// Changed top-level keys (tables or scalars).
    pub sections: BTreeSet<String>,
}

impl ConfigChange {
    /// Change touching exactly the given keys.
    #[must_use]
    pub fn of<I, S>(sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sections: sections.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the change touches `namespace`.
    #[must_use]
    pub fn affects(&self, namespace: &str) -> bool {
        self.sections.contains(namespace)
    }

    /// Whether the change alters the backend's configuration.
    #[must_use]
    pub fn affects_backend(&self) -> bool {
        self.affects(CONFIG_NAMESPACE)
            || NAMESPACE_ADJACENT_KEYS
                .iter()
                .any(|key| self.sections.contains(*key))
    }
}

/// Top-level keys that differ between `old` and `new`.
///
/// Keys added, removed, or whose values differ are all reported.
#[must_use]
pub fn changed_sections(old: &toml::Table, new: &toml::Table) -> BTreeSet<String> {
    let mut changed: BTreeSet<String> = old
        .iter()
        .filter(|(key, value)| new.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    changed.extend(
        new.keys()
            .filter(|key| !old.contains_key(*key))
            .cloned(),
    );
    changed
}

/// Read the config file as a raw TOML table.
///
/// # Errors
///
/// Returns `AppError::Config` if the file cannot be read or is not TOML.
pub(crate) fn read_table(path: &Path) -> Result<toml::Table> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| AppError::Config(format!("failed to read config for hot-reload: {err}")))?;
    toml::from_str::<toml::Table>(&raw)
        .map_err(|err| AppError::Config(format!("failed to parse config for hot-reload: {err}")))
}

/// Returns `true` for events that indicate `file_name` was written or
/// replaced (create, modify, remove).
fn is_config_change(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| file_name.is_some_and(|name| p.file_name() == Some(name)))
}

/// Watches `config.toml` and forwards [`ConfigChange`]s over a channel.
///
/// Dropping a `ConfigWatcher` stops the underlying OS watch, so callers
/// must keep it alive for as long as changes should be observed.
pub struct ConfigWatcher {
    /// Underlying notify watcher, kept alive by owning it here.
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Start watching `config_path`, sending changes to `changes`.
    ///
    /// The current file content becomes the baseline; an unreadable file
    /// starts from an empty table so the first successful read reports
    /// every key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the `notify` watcher cannot be created
    /// or the path cannot be watched.
    pub fn new(config_path: &Path, changes: mpsc::UnboundedSender<ConfigChange>) -> Result<Self> {
        let baseline = read_table(config_path).unwrap_or_else(|err| {
            warn!(%err, path = %config_path.display(), "failed to read initial config; diffing against empty");
            toml::Table::new()
        });

        let last_seen = Arc::new(Mutex::new(baseline));
        let path_for_callback = config_path.to_path_buf();
        let file_name = config_path.file_name().map(std::ffi::OsStr::to_os_string);

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_config_change(&event, file_name.as_deref()) => {
                    let fresh = match read_table(&path_for_callback) {
                        Ok(table) => table,
                        Err(err) => {
                            warn!(%err, path = %path_for_callback.display(), "config unreadable, keeping previous values");
                            return;
                        }
                    };
                    let mut guard = last_seen
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let sections = changed_sections(&guard, &fresh);
                    *guard = fresh;
                    drop(guard);

                    if sections.is_empty() {
                        debug!("config file touched without content change");
                        return;
                    }
                    info!(?sections, "config file changed");
                    if changes.send(ConfigChange { sections }).is_err() {
                        debug!("config change receiver dropped");
                    }
                }
                Err(err) => {
                    warn!(%err, "config file watcher error");
                }
                _ => {}
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create config file watcher: {err}")))?;

        // Watch the parent directory so atomic rename-based writes are seen.
        let watch_target = config_path
            .parent()
            .filter(|p| p != &Path::new(""))
            .unwrap_or(config_path);

        watcher
            .watch(watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch config path '{}': {err}",
                    watch_target.display()
                ))
            })?;

        info!(path = %config_path.display(), "config watcher started");

        Ok(Self {
            _watcher: watcher,
            path: config_path.to_path_buf(),
        })
    }

    /// Path of the watched config file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
