//! Worker loop (background process side).
//!
//! Runs inside the process spawned by the engine: a clean, non-interactive
//! execution context that reads one task frame per line from stdin,
//! executes it, reports the outcome as a `[[`-notification line, and then
//! always emits the idle sentinel. Stdout is the protocol channel — all
//! worker logging goes to stderr.
//!
//! The loop survives individual task failures: an error is caught, turned
//! into a notification, and the next frame is read. The loop only ends
//! when stdin closes or the engine kills the process.

pub mod fsops;

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, warn};

use crate::wire::frame::{decode_frame, Configure, FrameBody, IDLE_SENTINEL, NOTIFICATION_MARKER};
use crate::Result;

/// Per-worker settings established by the bootstrap `Configure` frame.
#[derive(Debug)]
struct WorkerContext {
    /// Emit an "executing: …" notification before each task (debug mode).
    echo_tasks: bool,
    /// Directory relative task paths are resolved against.
    base_dir: PathBuf,
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self {
            echo_tasks: false,
            base_dir: PathBuf::from("."),
        }
    }
}

impl WorkerContext {
    fn apply(&mut self, configure: Configure) {
        debug!(
            echo_tasks = configure.echo_tasks,
            base_dir = %configure.base_dir.display(),
            "worker configured"
        );
        self.echo_tasks = configure.echo_tasks;
        self.base_dir = configure.base_dir;
    }
}

/// Worker loop entry point: read frames from stdin until EOF.
///
/// Control frames update the worker context silently. Task frames produce
/// a success or failure notification followed by the idle sentinel; a
/// malformed frame is reported the same way so the foreground's
/// outstanding-count accounting stays aligned.
///
/// # Errors
///
/// Returns [`crate::AppError::Io`] only when stdin or stdout themselves
/// fail (the foreground is gone); task failures never escape the loop.
pub async fn run() -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut ctx = WorkerContext::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match decode_frame(&line) {
            Err(err) => {
                warn!(error = %err, "worker: rejected inbound frame");
                emit_notification(&mut stdout, &format!("error: {err}")).await?;
                emit_sentinel(&mut stdout).await?;
            }
            Ok(frame) => match frame.body {
                FrameBody::Configure(configure) => ctx.apply(configure),
                FrameBody::Task(task) => {
                    if ctx.echo_tasks {
                        emit_notification(&mut stdout, &format!("executing: {task}")).await?;
                    }

                    match fsops::execute(&task, &ctx.base_dir).await {
                        Ok(summary) => {
                            emit_notification(&mut stdout, &format!("done: {summary}")).await?;
                        }
                        Err(err) => {
                            warn!(error = %err, "worker: task execution failed");
                            emit_notification(&mut stdout, &format!("error: {task}: {err}"))
                                .await?;
                        }
                    }

                    emit_sentinel(&mut stdout).await?;
                }
            },
        }
    }

    debug!("worker: stdin closed, exiting");
    Ok(())
}

/// Write one `[[`-notification line.
///
/// The message is flattened onto one line; a notification must never span
/// multiple protocol lines.
async fn emit_notification(stdout: &mut Stdout, text: &str) -> Result<()> {
    let flat = text.replace('\n', " ");
    stdout
        .write_all(format!("{NOTIFICATION_MARKER}{flat}\n").as_bytes())
        .await?;
    stdout.flush().await?;
    Ok(())
}

/// Write the idle sentinel line.
async fn emit_sentinel(stdout: &mut Stdout) -> Result<()> {
    stdout
        .write_all(format!("{IDLE_SENTINEL}\n").as_bytes())
        .await?;
    stdout.flush().await?;
    Ok(())
}
