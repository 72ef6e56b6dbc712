#![forbid(unsafe_code)]

//! Supervisor and streaming chat client for a locally spawned agent server.

pub mod client;
pub mod config;
pub mod config_watcher;
pub mod controller;
pub mod errors;
pub mod ipc;
pub mod stream;
pub mod supervisor;

pub use config::{GlobalConfig, ServerConfig};
pub use errors::{AppError, Result};
