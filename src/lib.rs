#![forbid(unsafe_code)]

//! `file-courier` — background file-operation courier.
//!
//! Offloads long-running file operations (copy, move) from an interactive
//! foreground process to a single supervised background worker process.
//! The worker is the same binary re-invoked with the hidden `worker`
//! subcommand; the two processes talk over the worker's stdio pipes using
//! a line-oriented wire protocol.

pub mod config;
pub mod engine;
pub mod errors;
pub mod wire;
pub mod worker;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
