//! Global configuration parsing, validation, and credential loading.
//!
//! The TOML file is the long-lived source of truth. Every time it changes
//! a fresh, immutable [`ServerConfig`] snapshot is derived from it; the
//! snapshot is what the supervisor and controller act on.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Top-level table that holds every backend-related setting.
///
/// Configuration changes that touch nothing inside this namespace are
/// ignored by the controller.
pub const CONFIG_NAMESPACE: &str = "backend";

/// Top-level keys outside [`CONFIG_NAMESPACE`] that still alter the
/// derived [`ServerConfig`].
pub const NAMESPACE_ADJACENT_KEYS: &[&str] = &["workspace_dir"];

/// Keychain service name used for secret lookup.
const KEYRING_SERVICE: &str = "agent-tether";

/// Timeout values governing process supervision.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Budget for the backend to answer `/health` after spawn.
    #[serde(default = "default_health_seconds")]
    pub health_seconds: u64,
    /// Delay between two liveness probes.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Grace period after the termination signal before a forced kill.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
    /// Pause between stop and start so the OS releases the listening port.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_seconds: default_health_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_grace_seconds: default_stop_grace_seconds(),
            restart_settle_ms: default_restart_settle_ms(),
        }
    }
}

fn default_health_seconds() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stop_grace_seconds() -> u64 {
    5
}

fn default_restart_settle_ms() -> u64 {
    1000
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "openai/gpt-4o".into()
}

fn default_electerm_mcp_url() -> String {
    "http://127.0.0.1:30837/mcp".into()
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

fn default_external_backend_url() -> String {
    "http://127.0.0.1:8000".into()
}

fn default_resource_dir() -> PathBuf {
    PathBuf::from("resources").join("bin")
}

fn default_ipc_name() -> String {
    "agent-tether".into()
}

/// Settings of the `[backend]` namespace.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    /// Provider API base URL handed to the backend.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Provider model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Tool endpoint for the terminal MCP bridge.
    #[serde(default = "default_electerm_mcp_url")]
    pub electerm_mcp_url: String,
    /// Bind host for a self-supervised backend.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port for a self-supervised backend.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Talk to a backend the user runs themselves instead of spawning one.
    #[serde(default)]
    pub use_external_backend: bool,
    /// Base URL of the external backend.
    #[serde(default = "default_external_backend_url")]
    pub external_backend_url: String,
    /// Directory holding the bundled platform executables.
    #[serde(default = "default_resource_dir")]
    pub resource_dir: PathBuf,
    /// Explicit executable path, bypassing platform resolution.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Data directory used when no workspace is open.
    #[serde(default)]
    pub global_storage_dir: Option<PathBuf>,
    /// Supervision timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace whose data directory the backend should use.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Named pipe / Unix socket identifier for `agent-tether-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Backend namespace.
    pub backend: BackendConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load provider secrets from OS keychain with env-var fallback.
    ///
    /// Missing secrets are not an error: the backend may carry its own
    /// `.env`. A warning is logged and the value is left empty.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task panics.
    pub async fn load_credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            api_key: load_credential("litellm_api_key", "LITELLM_API_KEY").await?,
            tavily_api_key: load_credential("tavily_api_key", "TAVILY_API_KEY").await?,
        })
    }

    /// Supervision timing derived from `[backend.timeouts]`.
    #[must_use]
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let t = &self.backend.timeouts;
        SupervisorSettings {
            resource_dir: self.backend.resource_dir.clone(),
            health_timeout: Duration::from_secs(t.health_seconds),
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            stop_grace: Duration::from_secs(t.stop_grace_seconds),
            restart_settle: Duration::from_millis(t.restart_settle_ms),
        }
    }

    /// Data directory handed to the backend as `PROJECT_MEMORY_DIR`.
    ///
    /// Per-workspace when a workspace is known, otherwise the global
    /// storage directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        match &self.workspace_dir {
            Some(workspace) => workspace.join(".agent-tether").join("memory"),
            None => self
                .backend
                .global_storage_dir
                .clone()
                .unwrap_or_else(|| env::temp_dir().join("agent-tether")),
        }
    }

    fn validate(&self) -> Result<()> {
        let backend = &self.backend;
        let t = &backend.timeouts;

        if backend.use_external_backend && backend.external_backend_url.trim().is_empty() {
            return Err(AppError::Config(
                "external_backend_url must be set when use_external_backend is true".into(),
            ));
        }

        if !backend.use_external_backend && backend.port == 0 {
            return Err(AppError::Config("backend.port must be greater than zero".into()));
        }

        if t.health_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.health_seconds must be greater than zero".into(),
            ));
        }

        if t.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "timeouts.poll_interval_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Secrets resolved at runtime, never stored in the TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Provider API key (`LITELLM_API_KEY`).
    pub api_key: String,
    /// Web search tool key (`TAVILY_API_KEY`).
    pub tavily_api_key: String,
}

/// Timing and location knobs for [`crate::supervisor::ProcessSupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Directory holding the bundled platform executables.
    pub resource_dir: PathBuf,
    /// Budget for the backend to become healthy.
    pub health_timeout: Duration,
    /// Delay between liveness probes.
    pub poll_interval: Duration,
    /// Grace period before a forced kill.
    pub stop_grace: Duration,
    /// Pause between stop and start during a restart.
    pub restart_settle: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            resource_dir: default_resource_dir(),
            health_timeout: Duration::from_secs(default_health_seconds()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            stop_grace: Duration::from_secs(default_stop_grace_seconds()),
            restart_settle: Duration::from_millis(default_restart_settle_ms()),
        }
    }
}

/// Immutable snapshot of everything the backend needs at one point in time.
///
/// Rebuilt on every relevant configuration change and shared as
/// `Arc<ServerConfig>`; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Provider API key.
    pub api_key: String,
    /// Provider API base URL.
    pub api_base: String,
    /// Provider model identifier.
    pub model: String,
    /// Web search tool key.
    pub tavily_api_key: String,
    /// Terminal MCP bridge endpoint.
    pub electerm_mcp_url: String,
    /// Bind host for a self-supervised backend.
    pub host: String,
    /// Bind port for a self-supervised backend.
    pub port: u16,
    /// Whether the backend is supervised by someone else.
    pub use_external_backend: bool,
    /// Base URL of an external backend.
    pub external_backend_url: String,
    /// Conversation memory directory.
    pub data_dir: PathBuf,
    /// Explicit executable override.
    pub executable: Option<PathBuf>,
    /// Executable directory and lifecycle timings.
    pub supervision: SupervisorSettings,
}

impl ServerConfig {
    /// Build a snapshot from parsed configuration and resolved secrets.
    #[must_use]
    pub fn from_parts(global: &GlobalConfig, credentials: &Credentials) -> Self {
        let backend = &global.backend;
        Self {
            api_key: credentials.api_key.clone(),
            api_base: backend.api_base.clone(),
            model: backend.model.clone(),
            tavily_api_key: credentials.tavily_api_key.clone(),
            electerm_mcp_url: backend.electerm_mcp_url.clone(),
            host: backend.host.clone(),
            port: backend.port,
            use_external_backend: backend.use_external_backend,
            external_backend_url: backend.external_backend_url.clone(),
            data_dir: global.data_dir(),
            executable: backend.executable.clone(),
            supervision: global.supervisor_settings(),
        }
    }

    /// Reachable base URL without a trailing slash.
    ///
    /// The configured URL for an external backend, otherwise the local
    /// bind address (a wildcard host is reached over loopback).
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.use_external_backend {
            return self.external_backend_url.trim_end_matches('/').to_owned();
        }
        let host = match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            other => other,
        };
        format!("http://{host}:{}", self.port)
    }

    /// Environment handed to a self-supervised backend process.
    #[must_use]
    pub fn process_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("LITELLM_API_KEY", self.api_key.clone()),
            ("LITELLM_API_BASE", self.api_base.clone()),
            ("LITELLM_MODEL", self.model.clone()),
            ("TAVILY_API_KEY", self.tavily_api_key.clone()),
            ("ELECTERM_MCP_URL", self.electerm_mcp_url.clone()),
            ("SERVER_HOST", self.host.clone()),
            ("SERVER_PORT", self.port.to_string()),
            (
                "PROJECT_MEMORY_DIR",
                self.data_dir.to_string_lossy().into_owned(),
            ),
        ]
    }

    /// Body of `POST /reload-config` for an external backend.
    ///
    /// Only non-empty secrets, model, and tool-endpoint fields are sent;
    /// the backend keeps its own value for anything omitted.
    #[must_use]
    pub fn reload_payload(&self) -> serde_json::Map<String, serde_json::Value> {
        [
            ("LITELLM_API_KEY", &self.api_key),
            ("LITELLM_API_BASE", &self.api_base),
            ("LITELLM_MODEL", &self.model),
            ("TAVILY_API_KEY", &self.tavily_api_key),
            ("ELECTERM_MCP_URL", &self.electerm_mcp_url),
        ]
        .into_iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(key, value)| (key.to_owned(), serde_json::Value::String(value.clone())))
        .collect()
    }
}

/// Read the config file at `path` and derive a fresh [`ServerConfig`].
///
/// `workspace_override` (from the command line) wins over the file's
/// `workspace_dir`.
///
/// # Errors
///
/// Returns `AppError::Config` if the file is unreadable or invalid.
pub async fn load_server_config(
    path: &Path,
    workspace_override: Option<&Path>,
) -> Result<(GlobalConfig, ServerConfig)> {
    let mut global = GlobalConfig::load_from_path(path)?;
    if let Some(workspace) = workspace_override {
        global.workspace_dir = Some(workspace.to_path_buf());
    }
    let credentials = global.load_credentials().await?;
    let snapshot = ServerConfig::from_parts(&global, &credentials);
    Ok((global, snapshot))
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            tracing::debug!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    match env::var(env_key) {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(
                key = keyring_key,
                env_key, "credential not found in keychain or env var; leaving empty"
            );
            Ok(String::new())
        }
    }
}
