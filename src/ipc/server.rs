//! Control socket served to `agent-tether-ctl`.
//!
//! One JSON object per line in each direction. Requests name a verb and,
//! when the host was started with [`IPC_TOKEN_ENV`] set, carry the shared
//! token:
//!
//! ```json
//! {"command": "status", "auth_token": "..."}
//! ```
//!
//! Replies are either `{"ok": true, "data": ...}` or
//! `{"ok": false, "error": "..."}`.
//!
//! | verb      | effect                                              |
//! |-----------|-----------------------------------------------------|
//! | `status`  | supervisor state, URL, external flag, last exit     |
//! | `restart` | queue a restart in the controller's pending slot    |
//! | `reload`  | `POST /reload` on the backend                       |

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::controller::ControllerHandle;
use crate::{AppError, Result};

/// Environment variable holding the shared secret for IPC requests.
pub const IPC_TOKEN_ENV: &str = "AGENT_TETHER_IPC_TOKEN";

/// State shared by all IPC connections.
#[derive(Debug, Clone)]
pub struct IpcState {
    /// Socket / pipe name.
    pub ipc_name: String,
    /// Controller the commands are routed to.
    pub controller: ControllerHandle,
    /// Required token, when configured.
    pub auth_token: Option<String>,
}

impl IpcState {
    fn authorized(&self, presented: Option<&str>) -> bool {
        self.auth_token
            .as_deref()
            .is_none_or(|expected| presented == Some(expected))
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Status,
    Restart,
    Reload,
}

impl Verb {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "status" => Some(Self::Status),
            "restart" => Some(Self::Restart),
            "reload" => Some(Self::Reload),
            _ => None,
        }
    }
}

type Reply = std::result::Result<Value, String>;

fn encode(reply: Reply) -> String {
    let body = match reply {
        Ok(data) => json!({ "ok": true, "data": data }),
        Err(error) => json!({ "ok": false, "error": error }),
    };
    let mut line = body.to_string();
    line.push('\n');
    line
}

/// Bind the control socket and serve it until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the name is invalid or the socket cannot be
/// bound (for example another instance already owns it).
pub fn spawn_ipc_server(state: Arc<IpcState>, ct: CancellationToken) -> Result<JoinHandle<()>> {
    let name = state.ipc_name.clone();
    let ns_name = name
        .as_str()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;
    let listener = ListenerOptions::new()
        .name(ns_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to bind ipc socket '{name}': {err}")))?;

    info!(ipc_name = %name, "control socket listening");
    let span = info_span!("ipc_server", name = %name);
    Ok(tokio::spawn(accept_loop(listener, state, ct).instrument(span)))
}

async fn accept_loop(
    listener: interprocess::local_socket::tokio::Listener,
    state: Arc<IpcState>,
    ct: CancellationToken,
) {
    loop {
        let conn = tokio::select! {
            () = ct.cancelled() => break,
            conn = listener.accept() => conn,
        };
        match conn {
            Ok(stream) => {
                let state = Arc::clone(&state);
                tokio::spawn(serve_connection(stream, state).instrument(info_span!("ipc_conn")));
            }
            Err(err) => warn!(%err, "ipc accept failed"),
        }
    }
    info!("control socket closed");
}

async fn serve_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<IpcState>,
) {
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "ipc read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => handle(&envelope, &state).await,
            Err(err) => Err(format!("invalid json: {err}")),
        };
        if let Err(err) = send(&mut writer, reply).await {
            warn!(%err, "ipc write failed");
            break;
        }
    }
    debug!("ipc connection ended");
}

async fn send<W>(writer: &mut W, reply: Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(encode(reply).as_bytes()).await?;
    writer.flush().await
}

async fn handle(envelope: &Envelope, state: &IpcState) -> Reply {
    if !state.authorized(envelope.auth_token.as_deref()) {
        warn!(command = %envelope.command, "ipc request rejected: bad token");
        return Err("unauthorized".into());
    }
    let Some(verb) = Verb::parse(&envelope.command) else {
        return Err(format!("unknown command: {}", envelope.command));
    };

    let controller = &state.controller;
    match verb {
        Verb::Status => serde_json::to_value(controller.status())
            .map_err(|err| format!("status encoding: {err}")),
        Verb::Restart => {
            let coalesced = controller.request_restart();
            info!(coalesced, "restart queued over ipc");
            Ok(json!({ "queued": true, "coalesced": coalesced }))
        }
        Verb::Reload => controller
            .reload_agent()
            .await
            .map(|()| json!({ "reloaded": true }))
            .map_err(|err| err.to_string()),
    }
}
