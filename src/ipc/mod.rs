//! Local IPC layer for `agent-tether-ctl`.
//!
//! A named pipe (Windows) or Unix domain socket (Linux/macOS) server that
//! accepts JSON-line commands from the companion CLI.

pub mod server;

pub use server::{spawn_ipc_server, IpcState};
