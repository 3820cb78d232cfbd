//! Bounded parallel fan-out over volume files.
//!
//! Per-volume operations (remapping, channel extraction, header repair) are
//! embarrassingly parallel: each unit is processed on the blocking pool, a
//! `buffer_unordered` stream bounds concurrency to the budgeted worker count,
//! and per-unit failures are collected into a report instead of aborting the
//! batch. Downstream steps run against whatever succeeded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use walkdir::WalkDir;

use crate::nifti::is_volume_name;

/// One volume file found under a source directory.
#[derive(Debug, Clone)]
pub struct VolumeEntry {
    /// Absolute path of the source file.
    pub path: PathBuf,
    /// Path relative to the scanned root, preserved in the destination tree.
    pub relative: PathBuf,
}

/// A single unit that failed inside a batch.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of a batch operation.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Number of volumes processed successfully.
    pub processed: usize,
    /// Units that failed, with reasons.
    pub failures: Vec<UnitFailure>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects volume files under `root`, optionally recursing into subtrees.
pub fn collect_volumes(root: &Path, recursive: bool) -> Result<Vec<VolumeEntry>, std::io::Error> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).max_depth(max_depth).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walkdir error"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !is_volume_name(&name) {
            continue;
        }
        let path = entry.path().to_path_buf();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        entries.push(VolumeEntry { path, relative });
    }
    Ok(entries)
}

/// Runs `op` over every entry with at most `workers` units in flight.
///
/// The batch always runs to completion; failures are reported, not fatal.
pub async fn process_volumes<F>(entries: Vec<VolumeEntry>, workers: usize, op: F) -> BatchReport
where
    F: Fn(&VolumeEntry) -> Result<(), String> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let mut results = stream::iter(entries.into_iter().map(|entry| {
        let op = Arc::clone(&op);
        tokio::task::spawn_blocking(move || {
            let outcome = op(&entry);
            (entry.path, outcome)
        })
    }))
    .buffer_unordered(workers.max(1));

    let mut report = BatchReport::default();
    while let Some(joined) = results.next().await {
        match joined {
            Ok((_, Ok(()))) => report.processed += 1,
            Ok((path, Err(message))) => report.failures.push(UnitFailure { path, message }),
            Err(join_err) => report.failures.push(UnitFailure {
                path: PathBuf::new(),
                message: format!("worker panicked: {join_err}"),
            }),
        }
    }
    report
}
