//! Worker process spawner.
//!
//! Launches the background worker: the engine's own binary re-invoked with
//! the hidden `worker` subcommand, with:
//! - `kill_on_drop(true)` so the process is cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist, so nothing from the
//!   foreground environment leaks into the child beyond what it needs.
//! - Piped stdin/stdout owned by the engine; stderr is piped only in debug
//!   mode (mirrored to the diagnostics log) and discarded otherwise.

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Environment variables inherited by the spawned worker process.
///
/// Every other variable is stripped via `env_clear()` before the child is
/// launched.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "COMSPEC",
];

/// Active stdio connection to a freshly spawned worker process.
///
/// The caller keeps `child` alive (it has `kill_on_drop(true)`), writes
/// task frames to `stdin`, and attaches the output demultiplexer to
/// `stdout`.
#[derive(Debug)]
pub struct WorkerConnection {
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Worker stdin for sending task frames.
    pub stdin: ChildStdin,
    /// Worker stdout carrying notification and sentinel lines.
    pub stdout: ChildStdout,
    /// Worker stderr; present only in debug mode.
    pub stderr: Option<ChildStderr>,
}

/// Spawn the background worker process.
///
/// The worker program defaults to the running process's own binary
/// (`std::env::current_exe()`); `config.worker_program` overrides it.
///
/// Spawn failure is fatal to the caller's `start()` — it is surfaced as
/// [`AppError::Spawn`] with no retry.
///
/// # Errors
///
/// - `AppError::Spawn("cannot locate own executable: …")` — no override
///   configured and `current_exe()` failed.
/// - `AppError::Spawn("failed to spawn worker: …")` — OS spawn failure.
/// - `AppError::Spawn("failed to capture worker …")` — a requested pipe
///   was not attached.
pub fn spawn_worker(config: &GlobalConfig) -> Result<WorkerConnection> {
    let program = match &config.worker_program {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .map_err(|err| AppError::Spawn(format!("cannot locate own executable: {err}")))?,
    };

    let mut cmd = Command::new(&program);
    cmd.arg("worker");

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true);

    if config.debug {
        cmd.stderr(std::process::Stdio::piped());
    } else {
        cmd.stderr(std::process::Stdio::null());
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn worker: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture worker stdout".into()))?;
    let stderr = if config.debug {
        Some(
            child
                .stderr
                .take()
                .ok_or_else(|| AppError::Spawn("failed to capture worker stderr".into()))?,
        )
    } else {
        None
    };

    tracing::info!(program = %program.display(), "worker process spawned");

    Ok(WorkerConnection {
        child,
        stdin,
        stdout,
        stderr,
    })
}
