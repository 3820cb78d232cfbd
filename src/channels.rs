//! Alternate-channel selector.
//!
//! Derives an auxiliary per-case channel by filtering a label volume to a
//! prioritized subset of instance values: voxels whose value lies inside the
//! instance range *and* appears in the priority list are retained, everything
//! else becomes background. Two complementary priority lists (even- vs
//! odd-indexed instances) yield the primary and swapped auxiliary channels.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{collect_volumes, process_volumes, BatchReport};
use crate::nifti::{volume_stem, NiftiVolume};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Source label directory not found: {0}")]
    MissingSourceDir(PathBuf),

    #[error("Empty priority list")]
    EmptyPriorityList,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which instance values an auxiliary channel retains.
///
/// Membership filtering only: listed values inside the range survive, all
/// other voxels become 0. No arbitration between overlapping instances.
#[derive(Debug, Clone)]
pub struct ChannelSelection {
    pub value_range: RangeInclusive<i32>,
    pub priority: Vec<i32>,
}

impl ChannelSelection {
    pub fn new(value_range: RangeInclusive<i32>, priority: Vec<i32>) -> Self {
        Self {
            value_range,
            priority,
        }
    }

    fn retained(&self) -> HashSet<i32> {
        self.priority
            .iter()
            .copied()
            .filter(|v| self.value_range.contains(v))
            .collect()
    }
}

/// Extracts auxiliary channel volumes for every label volume under
/// `source_label_dir`.
///
/// Outputs are named `<stem><output_suffix>.nii.gz` under `dest_dir`
/// (conventionally suffix `_0001` next to the case's `_0000` primary).
pub async fn extract_alternate(
    source_label_dir: &Path,
    dest_dir: &Path,
    selection: &ChannelSelection,
    output_suffix: &str,
    recursive: bool,
    workers: usize,
) -> Result<BatchReport, ChannelError> {
    if !source_label_dir.is_dir() {
        return Err(ChannelError::MissingSourceDir(
            source_label_dir.to_path_buf(),
        ));
    }
    if selection.priority.is_empty() {
        return Err(ChannelError::EmptyPriorityList);
    }
    std::fs::create_dir_all(dest_dir)?;

    let entries = collect_volumes(source_label_dir, recursive)?;
    info!(
        source = %source_label_dir.display(),
        dest = %dest_dir.display(),
        volumes = entries.len(),
        retained = selection.retained().len(),
        suffix = output_suffix,
        "Extracting alternate channels"
    );

    let retained = Arc::new(selection.retained());
    let dest_root = dest_dir.to_path_buf();
    let suffix = output_suffix.to_string();

    let report = process_volumes(entries, workers, move |entry| {
        let name = entry.relative.file_name().unwrap_or_default().to_string_lossy();
        let stem = volume_stem(&name).ok_or_else(|| format!("unrecognized name '{name}'"))?;
        let out_path = dest_root.join(format!("{stem}{suffix}.nii.gz"));

        let mut volume = NiftiVolume::load(&entry.path).map_err(|e| e.to_string())?;
        volume.map_values_inplace(|v| if retained.contains(&v) { v } else { 0 });
        volume.save(&out_path).map_err(|e| e.to_string())?;
        Ok(())
    })
    .await;

    if !report.is_clean() {
        warn!(
            failed = report.failures.len(),
            processed = report.processed,
            "Channel extraction finished with failures"
        );
    }
    Ok(report)
}
