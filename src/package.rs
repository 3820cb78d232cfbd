//! Release packaging.
//!
//! Bundles everything needed to reproduce and deploy one trained run into a
//! single archive under `exports/`: the exported model, the test-evaluation
//! summary, a listing of the dataset case collections and the fold split
//! manifest. Archives are keyed by
//! `dataset x trainer x plan x configuration x fold`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, Header};
use thiserror::Error;
use tracing::info;

use crate::config::{Layout, PipelineConfig};
use crate::dataset::Dataset;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Required artifact missing: {0}")]
    MissingArtifact(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Builds the release archive for one run; returns its path.
pub fn package_run(
    layout: &Layout,
    config: &PipelineConfig,
    dataset: &Dataset,
) -> Result<PathBuf, PackageError> {
    let model = layout.model_export(
        dataset,
        &config.trainer_name,
        &config.plan_name,
        &config.configuration,
        config.fold,
    );
    if !model.is_file() {
        return Err(PackageError::MissingArtifact(model));
    }
    let archive_path = layout.package_archive(
        dataset,
        &config.trainer_name,
        &config.plan_name,
        &config.configuration,
        config.fold,
    );
    if let Some(parent) = archive_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Build to a temporary sibling first so an interrupted write never
    // leaves a half-archive passing the completion predicate.
    let staging = archive_path.with_file_name(format!(
        "{}.partial",
        archive_path.file_name().unwrap_or_default().to_string_lossy()
    ));
    let file = File::create(&staging)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    builder.append_path_with_name(&model, "model.zip")?;

    let summary = layout
        .predictions_dir(
            dataset,
            &config.trainer_name,
            &config.plan_name,
            &config.configuration,
            config.fold,
        )
        .join("summary.json");
    if summary.is_file() {
        builder.append_path_with_name(&summary, "evaluation/summary.json")?;
    }

    let splits = layout.splits_file(dataset);
    if splits.is_file() {
        builder.append_path_with_name(&splits, "splits_final.json")?;
    }

    let listing = collection_listing(layout, dataset)?;
    append_bytes(&mut builder, "dataset_contents.json", &listing)?;

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    std::fs::rename(&staging, &archive_path)?;
    info!(archive = %archive_path.display(), "Packaged run");
    Ok(archive_path)
}

/// JSON listing of every file in the dataset's case collections.
fn collection_listing(layout: &Layout, dataset: &Dataset) -> Result<Vec<u8>, PackageError> {
    let mut listing: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let collections = [
        ("imagesTr", layout.images_tr(dataset)),
        ("labelsTr", layout.labels_tr(dataset)),
        ("imagesTs", layout.images_ts(dataset)),
        ("labelsTs", layout.labels_ts(dataset)),
    ];
    for (name, dir) in collections {
        let mut files = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                files.push(entry?.file_name().to_string_lossy().to_string());
            }
        }
        files.sort();
        listing.insert(name, files);
    }
    Ok(serde_json::to_vec_pretty(&listing)?)
}

fn append_bytes<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    bytes: &[u8],
) -> Result<(), PackageError> {
    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, Cursor::new(bytes))?;
    Ok(())
}

/// Entries of a packaged archive, for verification.
pub fn archive_entries(path: &Path) -> Result<Vec<String>, PackageError> {
    let file = File::open(path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        names.push(entry?.path()?.display().to_string());
    }
    names.sort();
    Ok(names)
}
