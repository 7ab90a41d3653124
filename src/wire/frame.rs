//! Versioned task frames and worker-output line classification.
//!
//! Foreground → worker traffic is a stream of [`Frame`]s, one compact JSON
//! document per line. The frame carries an explicit protocol version and a
//! tagged body, so the worker decodes into the same typed schema and
//! dispatches on the variant — it never evaluates free-form input.
//!
//! Worker → foreground traffic is plain text. [`classify_line`] sorts each
//! received line into a [`ProtocolLine`]: a `[[`-prefixed notification, the
//! exact idle sentinel, or noise to be ignored.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Wire protocol version carried in every frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Exact line the worker emits after finishing each task.
pub const IDLE_SENTINEL: &str = "***IDLE***";

/// Two-character prefix marking a user-visible worker notification line.
pub const NOTIFICATION_MARKER: &str = "[[";

// ── Foreground → worker frames ───────────────────────────────────────────────

/// One foreground → worker message: a version tag plus a tagged body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version; the worker rejects frames it does not understand.
    pub v: u32,
    /// Frame payload.
    pub body: FrameBody,
}

impl Frame {
    /// Wrap a task in a current-version frame.
    #[must_use]
    pub fn task(task: Task) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            body: FrameBody::Task(task),
        }
    }

    /// Wrap a bootstrap configuration in a current-version frame.
    #[must_use]
    pub fn configure(configure: Configure) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            body: FrameBody::Configure(configure),
        }
    }
}

/// Frame payload: either a bootstrap control frame or a delegated task.
///
/// Control frames configure the worker and are acknowledged silently; only
/// task frames produce a notification and an idle sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameBody {
    /// Bootstrap configuration sent once per worker start.
    Configure(Configure),
    /// A delegated file operation.
    Task(Task),
}

/// Bootstrap configuration replicating the foreground's context into the
/// freshly spawned worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configure {
    /// Echo each task as a notification before executing it (debug mode).
    pub echo_tasks: bool,
    /// Directory relative task paths are resolved against, so the worker
    /// sees the same paths the foreground does.
    pub base_dir: PathBuf,
}

/// One delegated file operation.
///
/// The overwrite policy travels with the task; the worker never prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Copy each source into/onto `dest`.
    Copy {
        /// Files or directories to copy.
        sources: Vec<PathBuf>,
        /// Destination directory, or target path for a single source.
        dest: PathBuf,
        /// What to do when a target already exists.
        overwrite: OverwritePolicy,
    },
    /// Move each source into/onto `dest`.
    Move {
        /// Files or directories to move.
        sources: Vec<PathBuf>,
        /// Destination directory, or target path for a single source.
        dest: PathBuf,
        /// What to do when a target already exists.
        overwrite: OverwritePolicy,
    },
}

impl Task {
    /// Source paths of the operation.
    #[must_use]
    pub fn sources(&self) -> &[PathBuf] {
        match self {
            Self::Copy { sources, .. } | Self::Move { sources, .. } => sources,
        }
    }

    /// Destination path of the operation.
    #[must_use]
    pub fn dest(&self) -> &PathBuf {
        match self {
            Self::Copy { dest, .. } | Self::Move { dest, .. } => dest,
        }
    }

    /// Validate that the task can be carried on the line protocol.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the task has no sources, or if any
    /// path contains a raw newline — worker notifications echo paths into
    /// single-line messages, so such paths cannot be reported faithfully.
    pub fn validate(&self) -> Result<()> {
        if self.sources().is_empty() {
            return Err(AppError::Protocol("task has no source paths".into()));
        }
        let has_newline = |p: &PathBuf| p.to_string_lossy().contains('\n');
        if self.sources().iter().any(has_newline) || has_newline(self.dest()) {
            return Err(AppError::Protocol(
                "task paths must not contain raw newlines".into(),
            ));
        }
        Ok(())
    }
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Self::Copy { .. } => "copy",
            Self::Move { .. } => "move",
        };
        write!(
            f,
            "{verb} {} item(s) to {}",
            self.sources().len(),
            self.dest().display()
        )
    }
}

/// Policy applied when a task's target path already exists.
///
/// Carried as task data so the non-interactive worker never has to ask.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Replace any existing target.
    #[default]
    Always,
    /// Leave existing targets untouched and report them as skipped.
    Skip,
}

// ── Encode / decode ──────────────────────────────────────────────────────────

/// Serialize a frame to its single-line wire form (no trailing newline).
///
/// # Errors
///
/// Returns `AppError::Protocol` if a task frame fails [`Task::validate`]
/// or if serialization fails.
pub fn encode_frame(frame: &Frame) -> Result<String> {
    if let FrameBody::Task(task) = &frame.body {
        task.validate()?;
    }
    serde_json::to_string(frame)
        .map_err(|err| AppError::Protocol(format!("failed to encode frame: {err}")))
}

/// Parse one received line back into a [`Frame`].
///
/// # Errors
///
/// Returns `AppError::Protocol` if the line is not a valid frame or carries
/// an unsupported protocol version.
pub fn decode_frame(line: &str) -> Result<Frame> {
    let frame: Frame = serde_json::from_str(line)
        .map_err(|err| AppError::Protocol(format!("malformed frame: {err}")))?;
    if frame.v != PROTOCOL_VERSION {
        return Err(AppError::Protocol(format!(
            "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
            frame.v
        )));
    }
    Ok(frame)
}

// ── Worker → foreground line classification ──────────────────────────────────

/// A classified unit of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolLine {
    /// A `[[`-prefixed status or error message (marker stripped), forwarded
    /// to the user-visible message log.
    Notification(String),
    /// The worker finished one task and awaits the next.
    IdleSentinel,
    /// Anything else; ignored.
    Unclassified,
}

/// Classify one line of worker output.
///
/// The sentinel match is exact; a line merely containing the sentinel text
/// is not a sentinel.
#[must_use]
pub fn classify_line(line: &str) -> ProtocolLine {
    if line == IDLE_SENTINEL {
        ProtocolLine::IdleSentinel
    } else if let Some(text) = line.strip_prefix(NOTIFICATION_MARKER) {
        ProtocolLine::Notification(text.to_owned())
    } else {
        ProtocolLine::Unclassified
    }
}
