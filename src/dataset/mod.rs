//! Datasets, cases and the assembler.
//!
//! A dataset owns `imagesTr/labelsTr` and `imagesTs/labelsTs` case
//! collections under `raw/<DatasetName>/`. Cases are keyed by a sanitized
//! case key; the primary image channel is `<key>_0000.nii.gz`, auxiliary
//! channels use `_0001` and up, and the label is `<key>.nii.gz`.

pub mod assembler;
pub mod case_key;
pub mod descriptor;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub use assembler::{AssembleError, AssembleOptions, AssembledDataset, Assembler};
pub use descriptor::DatasetDescriptor;

use crate::nifti::volume_stem;

/// A dataset identity: small integer id plus human name.
///
/// Derived datasets record the id of the dataset they were built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: u16,
    pub name: String,
    pub source: Option<u16>,
}

impl Dataset {
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            source: None,
        }
    }

    pub fn derived_from(id: u16, name: impl Into<String>, source: u16) -> Self {
        Self {
            id,
            name: name.into(),
            source: Some(source),
        }
    }

    /// On-disk folder name, e.g. `Dataset101_TotalSpineSeg_step1`.
    pub fn folder_name(&self) -> String {
        format!("Dataset{:03}_{}", self.id, self.name)
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.folder_name())
    }
}

/// Case keys present as labels (`<key>.nii.gz`) in a directory.
pub fn label_case_keys(dir: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    if !dir.is_dir() {
        return Ok(keys);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = volume_stem(&name) {
            keys.insert(stem.to_string());
        }
    }
    Ok(keys)
}

/// Case keys present as primary image channels (`<key>_0000.nii.gz`).
pub fn image_case_keys(dir: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    if !dir.is_dir() {
        return Ok(keys);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = volume_stem(&name) {
            if let Some(key) = stem.strip_suffix("_0000") {
                keys.insert(key.to_string());
            }
        }
    }
    Ok(keys)
}

/// All channel files (`<key>_0000`, `<key>_0001`, ...) for one case.
pub fn case_channel_files(dir: &Path, key: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(files);
    }
    let prefix = format!("{key}_");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = volume_stem(&name) else {
            continue;
        };
        if let Some(channel) = stem.strip_prefix(&prefix) {
            // channel must be purely numeric (e.g. "0000"), not another
            // case key sharing the prefix
            if !channel.is_empty() && channel.bytes().all(|b| b.is_ascii_digit()) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
