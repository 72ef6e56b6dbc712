#![forbid(unsafe_code)]

//! `agent-tether-ctl`: send one command to a running `agent-tether`.
//!
//! Exit status is `0` when the host answered `ok`, `1` otherwise.

use std::io::{BufRead, BufReader, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde::Serialize;
use serde_json::Value;

/// Environment variable holding the shared IPC secret.
const IPC_TOKEN_ENV: &str = "AGENT_TETHER_IPC_TOKEN";

#[derive(Debug, Parser)]
#[command(
    name = "agent-tether-ctl",
    about = "Control a running agent-tether",
    version,
    long_about = None
)]
struct Cli {
    /// Control socket name (the host's `ipc_name` setting).
    #[arg(long, default_value = "agent-tether")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Show backend state, URL, and last exit.
    Status,
    /// Queue a backend restart with the configuration in effect.
    Restart,
    /// Ask the backend to rebuild its agent wiring.
    Reload,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
}

impl Command {
    fn verb(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Restart => "restart",
            Self::Reload => "reload",
        }
    }
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let request = Request {
        command: args.command.verb(),
        auth_token: std::env::var(IPC_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
    };

    match round_trip(&args.ipc_name, &request) {
        Ok(reply) => report(&reply),
        Err(err) => {
            eprintln!("cannot reach agent-tether on '{}': {err}", args.ipc_name);
            ExitCode::FAILURE
        }
    }
}

fn report(reply: &Value) -> ExitCode {
    if reply.get("ok").and_then(Value::as_bool) == Some(true) {
        match reply.get("data") {
            Some(data) => println!("{}", serde_json::to_string_pretty(data).unwrap_or_default()),
            None => println!("ok"),
        }
        ExitCode::SUCCESS
    } else {
        let message = reply
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        eprintln!("error: {message}");
        ExitCode::FAILURE
    }
}

/// Write one request line and read one reply line.
fn round_trip(
    ipc_name: &str,
    request: &Request<'_>,
) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let mut stream = Stream::connect(ipc_name.to_ns_name::<GenericNamespaced>()?)?;

    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.flush()?;

    let mut reply = String::new();
    BufReader::new(&stream).read_line(&mut reply)?;
    Ok(serde_json::from_str(reply.trim())?)
}
