#![forbid(unsafe_code)]

//! `agent-tether`: terminal chat front-end for a supervised agent backend.
//!
//! Bootstraps configuration, starts the backend through the controller,
//! watches the config file, serves the IPC socket for `agent-tether-ctl`,
//! and runs the interactive chat loop on stdin/stdout.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_tether::client::BackendClient;
use agent_tether::config::load_server_config;
use agent_tether::config_watcher::ConfigWatcher;
use agent_tether::controller::listener::spawn_config_listener;
use agent_tether::controller::{ConfigChangeController, ControllerHandle, Notice};
use agent_tether::ipc::server::IPC_TOKEN_ENV;
use agent_tether::ipc::{spawn_ipc_server, IpcState};
use agent_tether::stream::form::pick_button;
use agent_tether::stream::{FormButton, FormResponse, SessionUpdate, StreamEvent, StreamSession};
use agent_tether::supervisor::ProcessSupervisor;
use agent_tether::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-tether", about = "Chat with a supervised agent backend", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Workspace whose data directory the backend should use.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

const HELP: &str = "\
commands:
  <text>                          send a message
  /ask <text>                     send without streaming
  /stop                           stop the current reply
  /clear                          forget the conversation
  /form <id> <button> [k=v ...]   answer a form
  /restart                        restart the backend
  /reload                         reload the backend agent
  /status                         show backend status
  /quit                           exit";

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-tether bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let workspace = match args.workspace {
        Some(ws) => Some(
            ws.canonicalize()
                .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?,
        ),
        None => None,
    };
    let (global, snapshot) = load_server_config(&args.config, workspace.as_deref()).await?;
    info!(
        external = snapshot.use_external_backend,
        url = %snapshot.base_url(),
        data_dir = %snapshot.data_dir.display(),
        "configuration loaded"
    );

    // ── Start the controller and the backend ────────────
    let supervisor = ProcessSupervisor::new(Arc::new(snapshot));
    let (controller, mut notices, controller_task) = ConfigChangeController::spawn(supervisor);
    let ct = CancellationToken::new();

    let mut start_hint = None;
    if let Err(err) = controller.start().await {
        // Reported through the notice channel; the chat loop still runs so
        // the user can fix the config and restart.
        start_hint = err.user_hint();
    }

    // ── Config watcher ──────────────────────────────────
    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let _watcher = match ConfigWatcher::new(&args.config, change_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            warn!(%err, "config watcher unavailable; changes need a manual /restart");
            None
        }
    };
    let listener_task = spawn_config_listener(
        args.config.clone(),
        workspace,
        change_rx,
        controller.clone(),
        ct.clone(),
    );

    // ── IPC server ──────────────────────────────────────
    let ipc_state = Arc::new(IpcState {
        ipc_name: global.ipc_name.clone(),
        controller: controller.clone(),
        auth_token: std::env::var(IPC_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
    });
    let ipc_task = match spawn_ipc_server(ipc_state, ct.clone()) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(%err, "IPC server unavailable");
            None
        }
    };

    // ── Chat loop ───────────────────────────────────────
    let (session, mut updates) = StreamSession::new(BackendClient::new(controller.url_receiver()));
    let mut forms: HashMap<String, Vec<FormButton>> = HashMap::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    println!("{HELP}");
    if let Some(hint) = start_hint {
        println!("hint: {hint}");
    }

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if handle_input(line.trim(), &session, &controller, &forms).await == Flow::Quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "stdin read failed");
                    break;
                }
            },
            Some(update) = updates.recv() => render_update(update, &mut forms),
            Some(notice) = notices.recv() => render_notice(&notice),
        }
    }

    // ── Shutdown ────────────────────────────────────────
    session.cancel();
    ct.cancel();
    controller.shutdown().await;
    let _ = tokio::join!(controller_task, listener_task);
    if let Some(handle) = ipc_task {
        let _ = handle.await;
    }
    info!("agent-tether shut down");
    Ok(())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Flow {
    Continue,
    Quit,
}

/// One line of user input, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input<'a> {
    Blank,
    Quit,
    Help,
    Stop,
    Clear,
    Restart,
    Reload,
    Status,
    Ask(&'a str),
    Form(&'a str),
    Usage(&'static str),
    Chat(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    if line.is_empty() {
        return Input::Blank;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "/quit" | "/exit" => Input::Quit,
        "/help" => Input::Help,
        "/stop" => Input::Stop,
        "/clear" => Input::Clear,
        "/restart" => Input::Restart,
        "/reload" => Input::Reload,
        "/status" => Input::Status,
        "/ask" if rest.is_empty() => Input::Usage("usage: /ask <text>"),
        "/ask" => Input::Ask(rest),
        "/form" => Input::Form(rest),
        _ => Input::Chat(line),
    }
}

async fn handle_input(
    line: &str,
    session: &StreamSession,
    controller: &ControllerHandle,
    forms: &HashMap<String, Vec<FormButton>>,
) -> Flow {
    match parse_input(line) {
        Input::Blank => {}
        Input::Quit => return Flow::Quit,
        Input::Help => println!("{HELP}"),
        Input::Stop => {
            if !session.cancel() {
                println!("(nothing to stop)");
            }
        }
        Input::Clear => session.clear(),
        Input::Restart => {
            controller.request_restart();
        }
        Input::Reload => match controller.reload_agent().await {
            Ok(()) => println!("[backend agent reloaded]"),
            Err(err) => println!("[reload failed: {err}]"),
        },
        Input::Status => {
            let status = controller.status();
            println!(
                "[backend {:?} at {}{}; session {}]",
                status.state,
                status.url,
                if status.external { " (external)" } else { "" },
                session.session_id().as_deref().unwrap_or("none"),
            );
        }
        Input::Ask(text) => match session.ask(text).await {
            Ok(reply) => println!("{}", reply.reply),
            Err(err) => println!("[error: {err}]"),
        },
        Input::Form(args) => match parse_form_command(args, forms) {
            Ok(response) => {
                session.respond_to_form(&response);
            }
            Err(msg) => println!("[{msg}]"),
        },
        Input::Usage(usage) => println!("[{usage}]"),
        Input::Chat(text) => {
            session.send(text);
        }
    }
    Flow::Continue
}

fn parse_form_command(
    args: &str,
    forms: &HashMap<String, Vec<FormButton>>,
) -> std::result::Result<FormResponse, String> {
    let mut parts = args.split_whitespace();
    let (Some(form_id), Some(selector)) = (parts.next(), parts.next()) else {
        return Err("usage: /form <id> <button> [name=value ...]".into());
    };
    let buttons = forms
        .get(form_id)
        .ok_or_else(|| format!("unknown form {form_id}"))?;
    let button =
        pick_button(buttons, selector).ok_or_else(|| format!("form {form_id} has no button {selector}"))?;

    let mut response = FormResponse::new(form_id, button.value.clone());
    for pair in parts {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(format!("expected name=value, got {pair}"));
        };
        response = response.with_value(name, value);
    }
    Ok(response)
}

fn render_update(update: SessionUpdate, forms: &mut HashMap<String, Vec<FormButton>>) {
    let mut out = std::io::stdout().lock();
    let _ = match update {
        SessionUpdate::Event(StreamEvent::TextChunk { data }) => write!(out, "{data}"),
        SessionUpdate::Event(StreamEvent::ToolStart { name, agent, .. }) => {
            writeln!(out, "\n[{agent} → {name}]")
        }
        SessionUpdate::Event(StreamEvent::ToolResult { name, .. }) => {
            writeln!(out, "[{name} done]")
        }
        SessionUpdate::Event(StreamEvent::FormRequest {
            id,
            title,
            description,
            buttons,
            fields,
        }) => {
            let _ = writeln!(out, "\n[form {id}] {title}\n  {description}");
            for (i, button) in buttons.iter().enumerate() {
                let _ = writeln!(out, "  {}. {} ({})", i + 1, button.label, button.value);
            }
            for field in &fields {
                let _ = writeln!(out, "  field {}: {}", field.name, field.label);
            }
            forms.insert(id, buttons);
            Ok(())
        }
        SessionUpdate::Event(StreamEvent::Done | StreamEvent::Error { .. }) => Ok(()),
        SessionUpdate::TurnCompleted { .. } => writeln!(out),
        SessionUpdate::TurnFailed { message } => writeln!(out, "\n[error: {message}]"),
        SessionUpdate::Stopped { context_preserved } => {
            if context_preserved {
                writeln!(out, "\n[stopped; context preserved]")
            } else {
                writeln!(out, "\n[stopped]")
            }
        }
        SessionUpdate::Cleared => writeln!(out, "[history cleared]"),
    };
    let _ = out.flush();
}

fn render_notice(notice: &Notice) {
    match notice {
        Notice::Progress(msg) => println!("[{msg}…]"),
        Notice::Info(msg) => println!("[{msg}]"),
        Notice::Warning(msg) => println!("[warning: {msg}]"),
        Notice::Error(msg) => println!("[error: {msg}]"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so they do not interleave with the chat on stdout.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
