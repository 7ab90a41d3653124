//! Execution of delegated copy/move operations.
//!
//! Semantics follow the usual shell conventions: when the destination is
//! an existing directory, each source is transferred into it under its own
//! file name; otherwise a single source is transferred onto the
//! destination path itself. Directories are copied recursively. Moves try
//! a rename first and fall back to copy-then-remove across filesystems.
//!
//! The task's [`OverwritePolicy`] decides what happens to existing
//! targets; the worker never prompts.

use std::fmt::Write as _;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::fs;

use crate::wire::frame::{OverwritePolicy, Task};
use crate::{AppError, Result};

/// Per-source transfer result.
enum Outcome {
    /// The source was copied or moved.
    Done,
    /// The target existed and the policy said to leave it alone.
    Skipped,
}

/// Execute one delegated task, returning a human-readable summary.
///
/// Relative paths are resolved against `base_dir` (the foreground's
/// working directory, delivered in the bootstrap frame).
///
/// # Errors
///
/// Returns [`AppError::Task`] for semantic failures (missing source,
/// multiple sources onto a non-directory) and [`AppError::Io`] for
/// filesystem failures. Execution stops at the first failing source.
pub async fn execute(task: &Task, base_dir: &Path) -> Result<String> {
    let remove_source = matches!(task, Task::Move { .. });
    let overwrite = match task {
        Task::Copy { overwrite, .. } | Task::Move { overwrite, .. } => *overwrite,
    };

    let dest = resolve(base_dir, task.dest());
    let into_dir = fs::metadata(&dest).await.is_ok_and(|meta| meta.is_dir());

    if task.sources().len() > 1 && !into_dir {
        return Err(AppError::Task(format!(
            "destination {} must be an existing directory for multiple sources",
            dest.display()
        )));
    }

    let mut done = 0usize;
    let mut skipped = 0usize;

    for source in task.sources() {
        let src = resolve(base_dir, source);
        let target = if into_dir {
            let name = src.file_name().ok_or_else(|| {
                AppError::Task(format!("source {} has no file name", src.display()))
            })?;
            dest.join(name)
        } else {
            dest.clone()
        };

        match transfer(&src, &target, overwrite, remove_source).await? {
            Outcome::Done => done += 1,
            Outcome::Skipped => skipped += 1,
        }
    }

    let verb = if remove_source { "moved" } else { "copied" };
    let mut summary = format!("{verb} {done} item(s) to {}", dest.display());
    if skipped > 0 {
        let _ = write!(summary, ", skipped {skipped} existing");
    }
    Ok(summary)
}

/// Resolve a task path against the worker's base directory.
fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Transfer one source to its target, honoring the overwrite policy.
///
/// For moves (`remove_source`), a same-filesystem rename is attempted
/// first; on failure the transfer falls back to copy-then-remove.
async fn transfer(
    src: &Path,
    target: &Path,
    overwrite: OverwritePolicy,
    remove_source: bool,
) -> Result<Outcome> {
    let meta = fs::metadata(src)
        .await
        .map_err(|err| AppError::Task(format!("{}: {err}", src.display())))?;

    if target == src {
        return Err(AppError::Task(format!(
            "{} and {} are the same file",
            src.display(),
            target.display()
        )));
    }
    // A target inside the source would make the recursive walk descend
    // into its own output.
    if meta.is_dir() && target.starts_with(src) {
        return Err(AppError::Task(format!(
            "cannot copy {} into itself, {}",
            src.display(),
            target.display()
        )));
    }

    if fs::symlink_metadata(target).await.is_ok() {
        match overwrite {
            OverwritePolicy::Skip => return Ok(Outcome::Skipped),
            OverwritePolicy::Always => remove_existing(target).await?,
        }
    }

    if remove_source {
        // Fast path when source and target share a filesystem.
        if fs::rename(src, target).await.is_ok() {
            return Ok(Outcome::Done);
        }
    }

    if meta.is_dir() {
        copy_dir(src, target).await?;
    } else {
        fs::copy(src, target).await.map_err(|err| {
            AppError::Task(format!(
                "copy {} -> {}: {err}",
                src.display(),
                target.display()
            ))
        })?;
    }

    if remove_source {
        if meta.is_dir() {
            fs::remove_dir_all(src).await?;
        } else {
            fs::remove_file(src).await?;
        }
    }

    Ok(Outcome::Done)
}

/// Remove an existing target, file or directory tree.
async fn remove_existing(target: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(target).await?;
    if meta.is_dir() {
        fs::remove_dir_all(target).await?;
    } else {
        fs::remove_file(target).await?;
    }
    Ok(())
}

/// Recursively copy a directory tree.
fn copy_dir<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(dst).await?;
        let mut entries = fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from = entry.path();
            let to = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir(&from, &to).await?;
            } else {
                fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    })
}
