//! Asynchronous task delegation engine (foreground side).
//!
//! The [`Engine`] is one explicit context object owning everything that
//! used to be ambient singletons in designs like this: the worker process
//! handle, the outstanding-task counter, and the idle-shutdown timer. The
//! caller creates exactly one instance, wraps it in an [`Arc`], and submits
//! [`Task`]s through it; user-visible output arrives as [`EngineEvent`]s on
//! the channel supplied at construction.
//!
//! Lifecycle: [`Engine::submit`] lazily (re)starts the worker, disarms the
//! idle timer, increments the outstanding count, and transmits the encoded
//! frame. The output demultiplexer decrements the count per idle sentinel
//! and re-arms the timer when the count reaches zero; the timer stops the
//! worker after the configured idle period. [`Engine::stop`] is idempotent
//! and discards all in-flight work.

pub mod demux;
pub mod spawner;

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::engine::demux::{run_demux, DemuxMode};
use crate::engine::spawner::spawn_worker;
use crate::wire::frame::{encode_frame, Configure, Frame, Task};
use crate::{AppError, Result};

// ── Events ───────────────────────────────────────────────────────────────────

/// User-visible output of the engine, delivered via the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A `[[`-notification from the worker (marker stripped).
    Notification(String),
    /// Raw worker output or stderr mirrored in debug mode.
    Diagnostic(String),
    /// A foreground-side failure surfaced to the user (spawn, transmit).
    Error(String),
    /// The worker's output stream ended; the worker is gone or dying.
    WorkerExited {
        /// Human-readable cause ("stream closed", "stream error: …").
        reason: String,
    },
}

// ── Engine state ─────────────────────────────────────────────────────────────

/// Live connection to a running worker process.
#[derive(Debug)]
struct WorkerHandle {
    /// Child handle — kept alive so `kill_on_drop` works, killed on stop.
    child: Child,
    /// Worker stdin for task frames, behind its own lock so writers never
    /// hold the engine state lock across a pipe write.
    stdin: Arc<Mutex<ChildStdin>>,
    /// Cancels the demux (and stderr mirror) tasks for this worker.
    cancel: CancellationToken,
    /// Demultiplexer task over the worker's stdout.
    demux: JoinHandle<()>,
    /// Stderr mirror task; present only in debug mode.
    stderr_mirror: Option<JoinHandle<()>>,
}

/// Mutable engine state behind the single lock.
#[derive(Debug, Default)]
struct EngineState {
    /// Zero or one worker process at any time.
    worker: Option<WorkerHandle>,
    /// Tasks sent but not yet confirmed finished. Never goes negative:
    /// stray sentinels are clamped.
    outstanding: u64,
    /// Cancellation token of the pending idle-shutdown timer, if armed.
    idle_timer: Option<CancellationToken>,
}

/// The task delegation engine.
///
/// One instance per process; see the module docs for the lifecycle.
#[derive(Debug)]
pub struct Engine {
    config: GlobalConfig,
    event_tx: mpsc::Sender<EngineEvent>,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Create an engine that reports user-visible output on `event_tx`.
    ///
    /// No worker is started until the first [`submit`](Self::submit) or an
    /// explicit [`start`](Self::start).
    #[must_use]
    pub fn new(config: GlobalConfig, event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    // ── Dispatcher ───────────────────────────────────────────────────────

    /// Submit a task for background execution.
    ///
    /// Encodes the frame first, then ensures a live worker (spawning one
    /// if absent or exited), disarms any pending idle timer, increments
    /// the outstanding count, and writes the frame to the worker's stdin.
    /// Returns as soon as the bytes are written; completion is reported
    /// asynchronously as an [`EngineEvent::Notification`].
    ///
    /// Tasks are executed strictly in submission order.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] — the task cannot be encoded on one line.
    ///   Rejected before any accounting: the count, the timer, and the
    ///   worker are left exactly as they were.
    /// - [`AppError::Spawn`] — the worker could not be (re)started; fatal,
    ///   no retry, resubmit explicitly.
    /// - [`AppError::Transmit`] — the write failed (e.g. the worker died
    ///   mid-submit). The outstanding count is not rolled back; accounting
    ///   self-heals because the next submission re-spawns the worker.
    pub async fn submit(self: &Arc<Self>, task: Task) -> Result<()> {
        let line = encode_frame(&Frame::task(task))?;

        let mut state = self.state.lock().await;

        if !worker_alive(&mut state) {
            self.start_locked(&mut state).await?;
        }

        Self::disarm_idle_timer_locked(&mut state);
        state.outstanding += 1;
        let outstanding = state.outstanding;

        let Some(worker) = state.worker.as_ref() else {
            return Err(AppError::Transmit("worker handle missing after start".into()));
        };
        let stdin = Arc::clone(&worker.stdin);
        // The pipe write can block on a saturated pipe; the state lock must
        // not be held across it — the demux needs the lock to consume
        // sentinels, and the worker needs the demux to drain its stdout.
        drop(state);

        let mut stdin = stdin.lock().await;
        if let Err(err) = write_line(&mut stdin, &line).await {
            let msg = format!("failed to transmit task to worker: {err}");
            warn!(error = %err, "task transmission failed");
            self.emit(EngineEvent::Error(msg.clone())).await;
            return Err(AppError::Transmit(msg));
        }

        debug!(outstanding, "task transmitted to worker");
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Start the background worker, stopping any existing one first.
    ///
    /// Resets the outstanding count to zero, spawns the worker with piped
    /// stdio, attaches the output demultiplexer (mirror mode when debug is
    /// on), and sends the bootstrap [`Configure`] frame.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be created and
    /// [`AppError::Transmit`] if the bootstrap frame cannot be written.
    /// Both are fatal to this call; there is no retry.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state).await
    }

    /// Stop the background worker and discard all in-flight work.
    ///
    /// Idempotent: cancels any pending idle timer, resets the outstanding
    /// count to zero, and kills the worker if one exists. Calling with no
    /// worker is a no-op beyond the timer cancellation.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        Self::disarm_idle_timer_locked(&mut state);
        state.outstanding = 0;

        if let Some(handle) = state.worker.take() {
            shutdown_worker(handle).await;
            info!("background worker stopped");
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// Number of tasks sent but not yet confirmed finished.
    pub async fn outstanding(&self) -> u64 {
        self.state.lock().await.outstanding
    }

    /// Whether a worker process is currently alive.
    pub async fn worker_running(&self) -> bool {
        let mut state = self.state.lock().await;
        worker_alive(&mut state)
    }

    // ── Demux callbacks ──────────────────────────────────────────────────

    /// Forward an event to the user-visible channel, dropping it if the
    /// receiver is gone.
    pub(crate) async fn emit(&self, event: EngineEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("engine event channel closed; dropping event");
        }
    }

    /// Record one idle sentinel from the worker.
    ///
    /// Decrements the outstanding count (clamped at zero — a stray
    /// sentinel after a manual stop is expected, not an error) and arms
    /// the idle timer when the count reaches zero.
    pub(crate) async fn on_idle_sentinel(self: &Arc<Self>) {
        let mut state = self.state.lock().await;

        if state.outstanding == 0 {
            debug!("stray idle sentinel with no outstanding tasks; clamped");
        } else {
            state.outstanding -= 1;
        }

        debug!(outstanding = state.outstanding, "idle sentinel consumed");

        if state.outstanding == 0 {
            self.arm_idle_timer_locked(&mut state);
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Start a fresh worker under the held state lock.
    async fn start_locked(self: &Arc<Self>, state: &mut EngineState) -> Result<()> {
        Self::disarm_idle_timer_locked(state);
        if let Some(handle) = state.worker.take() {
            shutdown_worker(handle).await;
        }
        state.outstanding = 0;

        let mut conn = spawn_worker(&self.config)?;
        let stdin = Arc::new(Mutex::new(conn.stdin));

        let cancel = CancellationToken::new();
        let mode = if self.config.debug {
            DemuxMode::Mirror
        } else {
            DemuxMode::Classify
        };
        let demux = tokio::spawn(run_demux(
            Arc::clone(self),
            conn.stdout,
            mode,
            cancel.clone(),
        ));
        let stderr_mirror = conn
            .stderr
            .take()
            .map(|stderr| tokio::spawn(mirror_stderr(Arc::clone(self), stderr, cancel.clone())));

        // Bootstrap: replicate the foreground's context into the worker.
        let base_dir = std::env::current_dir()
            .map_err(|err| AppError::Spawn(format!("cannot determine working directory: {err}")))?;
        let configure = Frame::configure(Configure {
            echo_tasks: self.config.debug,
            base_dir,
        });
        let line = encode_frame(&configure)?;
        write_line(&mut *stdin.lock().await, &line)
            .await
            .map_err(|err| AppError::Transmit(format!("failed to send bootstrap frame: {err}")))?;

        state.worker = Some(WorkerHandle {
            child: conn.child,
            stdin,
            cancel,
            demux,
            stderr_mirror,
        });

        info!(debug = self.config.debug, "background worker started");
        Ok(())
    }

    /// Schedule the one-shot idle shutdown, replacing any pending timer.
    ///
    /// Debug mode never auto-stops the worker.
    fn arm_idle_timer_locked(self: &Arc<Self>, state: &mut EngineState) {
        Self::disarm_idle_timer_locked(state);

        if self.config.debug {
            return;
        }

        let cancel = CancellationToken::new();
        let engine = Arc::clone(self);
        let timeout = self.config.idle_timeout();
        let timer_cancel = cancel.clone();

        // Detached one-shot; disarm cancels the token, not the task.
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = timer_cancel.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    info!(timeout_secs = timeout.as_secs(), "idle timeout reached, stopping worker");
                    engine.stop().await;
                    engine
                        .emit(EngineEvent::Diagnostic(
                            "worker stopped after idle timeout".to_owned(),
                        ))
                        .await;
                }
            }
        });

        state.idle_timer = Some(cancel);
    }

    /// Cancel any pending idle timer.
    fn disarm_idle_timer_locked(state: &mut EngineState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
    }
}

// ── Free helpers ─────────────────────────────────────────────────────────────

/// Whether the tracked worker process is still running.
///
/// Absent and exited are equivalent: both mean "needs (re)start".
fn worker_alive(state: &mut EngineState) -> bool {
    match state.worker.as_mut() {
        None => false,
        Some(handle) => matches!(handle.child.try_wait(), Ok(None)),
    }
}

/// Kill a worker and tear down its reader tasks.
async fn shutdown_worker(mut handle: WorkerHandle) {
    handle.cancel.cancel();
    if let Err(err) = handle.child.kill().await {
        warn!(error = %err, "failed to kill worker process");
    }
    handle.demux.abort();
    if let Some(mirror) = handle.stderr_mirror {
        mirror.abort();
    }
}

/// Write one protocol line plus the terminator and flush.
async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Mirror the worker's stderr into the diagnostics event stream (debug mode).
async fn mirror_stderr(engine: Arc<Engine>, stderr: ChildStderr, cancel: CancellationToken) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => engine.emit(EngineEvent::Diagnostic(text)).await,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(error = %err, "stderr mirror: read error, stopping");
                        break;
                    }
                }
            }
        }
    }
}
