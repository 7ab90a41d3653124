//! Output demultiplexer for the worker's stdout stream.
//!
//! Drives a [`FramedRead`] over the worker's stdout using [`WireCodec`],
//! classifies each decoded line via [`classify_line`], and reacts in strict
//! arrival order:
//!
//! - notification → forwarded to the user-visible event channel,
//! - idle sentinel → reported to the engine (outstanding-count bookkeeping
//!   and idle-timer arming),
//! - anything else → ignored.
//!
//! In debug mode the demultiplexer runs in mirror mode instead: every line
//! is forwarded verbatim as a diagnostic and sentinel handling is disabled,
//! so the worker can be inspected manually without being auto-stopped.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::engine::{Engine, EngineEvent};
use crate::wire::codec::WireCodec;
use crate::wire::frame::{classify_line, ProtocolLine};
use crate::AppError;

/// How the demultiplexer treats worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxMode {
    /// Normal operation: classify lines and drive outstanding-count
    /// accounting.
    Classify,
    /// Debug operation: forward every line verbatim as a diagnostic; the
    /// idle sentinel has no effect.
    Mirror,
}

/// Demultiplexer task — consumes worker stdout until EOF or cancellation.
///
/// On EOF or a non-recoverable stream error an
/// [`EngineEvent::WorkerExited`] is emitted; the engine re-spawns the
/// worker on the next submission. Over-long lines are skipped without
/// terminating the task.
pub async fn run_demux<R>(engine: Arc<Engine>, stdout: R, mode: DemuxMode, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, WireCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("demux: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("demux: worker stdout closed");
                        engine
                            .emit(EngineEvent::WorkerExited {
                                reason: "stream closed".to_owned(),
                            })
                            .await;
                        break;
                    }

                    Some(Err(AppError::Protocol(msg))) => {
                        // Framing error (line too long) — skip and continue.
                        warn!(error = msg.as_str(), "demux: framing error, skipping line");
                    }

                    Some(Err(err)) => {
                        warn!(error = %err, "demux: stream error, stopping");
                        engine
                            .emit(EngineEvent::WorkerExited {
                                reason: format!("stream error: {err}"),
                            })
                            .await;
                        break;
                    }

                    Some(Ok(line)) => process_line(&engine, mode, line).await,
                }
            }
        }
    }
}

/// Handle one decoded line according to the demultiplexer mode.
async fn process_line(engine: &Arc<Engine>, mode: DemuxMode, line: String) {
    match mode {
        DemuxMode::Mirror => {
            engine.emit(EngineEvent::Diagnostic(line)).await;
        }
        DemuxMode::Classify => match classify_line(&line) {
            ProtocolLine::Notification(text) => {
                engine.emit(EngineEvent::Notification(text)).await;
            }
            ProtocolLine::IdleSentinel => {
                engine.on_idle_sentinel().await;
            }
            ProtocolLine::Unclassified => {
                trace!(line = line.as_str(), "demux: unclassified line ignored");
            }
        },
    }
}
