//! Label remap engine.
//!
//! Applies a declarative source-value to target-value mapping over every
//! label volume under a directory, batched and parallelized. A malformed map
//! is a configuration error reported before any volume is touched; a corrupt
//! input volume fails only that unit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{collect_volumes, process_volumes, BatchReport};
use crate::nifti::{volume_stem, NiftiVolume};

/// Errors raised by label map construction and batch remapping.
#[derive(Debug, Error)]
pub enum RemapError {
    #[error("Source directory not found: {0}")]
    MissingSourceDir(PathBuf),

    #[error("Malformed label map '{origin}': {reason}")]
    MalformedMap { origin: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Policy for source values absent from the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmappedPolicy {
    /// Unmapped non-zero values become the given background value.
    Background(i32),
    /// Unmapped values pass through unchanged.
    Preserve,
}

impl Default for UnmappedPolicy {
    fn default() -> Self {
        UnmappedPolicy::Background(0)
    }
}

/// Declarative source-to-target integer label translation table.
///
/// Immutable once built. Zero always passes through unless explicitly
/// remapped.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    entries: BTreeMap<i32, i32>,
    unmapped: UnmappedPolicy,
}

impl LabelMap {
    /// Builds a map from explicit pairs, rejecting duplicate source keys.
    pub fn from_entries<I>(pairs: I) -> Result<Self, RemapError>
    where
        I: IntoIterator<Item = (i32, i32)>,
    {
        let mut entries = BTreeMap::new();
        for (source, target) in pairs {
            if entries.insert(source, target).is_some() {
                return Err(RemapError::MalformedMap {
                    origin: "<entries>".to_string(),
                    reason: format!("duplicate source value {source}"),
                });
            }
        }
        Ok(Self {
            entries,
            unmapped: UnmappedPolicy::default(),
        })
    }

    /// Parses the flat JSON object format: string integer keys, integer values.
    pub fn from_json_str(origin: &str, json: &str) -> Result<Self, RemapError> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let source: i32 = key.trim().parse().map_err(|_| RemapError::MalformedMap {
                origin: origin.to_string(),
                reason: format!("non-integer key '{key}'"),
            })?;
            let target = value.as_i64().ok_or_else(|| RemapError::MalformedMap {
                origin: origin.to_string(),
                reason: format!("non-integer value for key '{key}'"),
            })? as i32;
            entries.insert(source, target);
        }
        Ok(Self {
            entries,
            unmapped: UnmappedPolicy::default(),
        })
    }

    /// Loads a label map JSON file.
    pub fn from_file(path: &Path) -> Result<Self, RemapError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&path.display().to_string(), &json)
    }

    /// Sets the policy for source values absent from the map.
    pub fn with_unmapped_policy(mut self, policy: UnmappedPolicy) -> Self {
        self.unmapped = policy;
        self
    }

    /// Derives the swapped counterpart: for each `(a, b)` pair, entries
    /// targeting class `a` now target class `b` and vice versa.
    pub fn with_swapped_targets(&self, pairs: &[(i32, i32)]) -> Self {
        let mut entries = self.entries.clone();
        for target in entries.values_mut() {
            for &(a, b) in pairs {
                if *target == a {
                    *target = b;
                    break;
                } else if *target == b {
                    *target = a;
                    break;
                }
            }
        }
        Self {
            entries,
            unmapped: self.unmapped,
        }
    }

    /// Identity map over the given values.
    pub fn identity<I: IntoIterator<Item = i32>>(values: I) -> Self {
        Self {
            entries: values.into_iter().map(|v| (v, v)).collect(),
            unmapped: UnmappedPolicy::default(),
        }
    }

    /// Maps one voxel value.
    pub fn apply(&self, value: i32) -> i32 {
        if let Some(&target) = self.entries.get(&value) {
            return target;
        }
        if value == 0 {
            return 0;
        }
        match self.unmapped {
            UnmappedPolicy::Background(bg) => bg,
            UnmappedPolicy::Preserve => value,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct target class values, sorted.
    pub fn target_classes(&self) -> Vec<i32> {
        let mut targets: Vec<i32> = self.entries.values().copied().collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

/// Remaps every label volume under `source_dir` into `dest_dir`.
///
/// Output files are named `<stem><output_suffix>.nii.gz`, so multiple remap
/// passes over the same source can coexist as sibling files. Returns the
/// batch report; per-volume failures do not abort the batch.
pub async fn remap_dir(
    source_dir: &Path,
    dest_dir: &Path,
    map: &LabelMap,
    output_suffix: Option<&str>,
    recursive: bool,
    workers: usize,
) -> Result<BatchReport, RemapError> {
    if !source_dir.is_dir() {
        return Err(RemapError::MissingSourceDir(source_dir.to_path_buf()));
    }
    std::fs::create_dir_all(dest_dir)?;

    let entries = collect_volumes(source_dir, recursive)?;
    let total = entries.len();
    info!(
        source = %source_dir.display(),
        dest = %dest_dir.display(),
        volumes = total,
        entries = map.len(),
        "Remapping label volumes"
    );

    let map = Arc::new(map.clone());
    let dest_root = dest_dir.to_path_buf();
    let suffix = output_suffix.unwrap_or("").to_string();

    let report = process_volumes(entries, workers, move |entry| {
        let name = entry.relative.file_name().unwrap_or_default().to_string_lossy();
        let stem = volume_stem(&name).ok_or_else(|| format!("unrecognized name '{name}'"))?;
        let out_name = format!("{stem}{suffix}.nii.gz");
        let out_path = match entry.relative.parent() {
            Some(parent) if parent.as_os_str().is_empty() => dest_root.join(&out_name),
            Some(parent) => {
                let dir = dest_root.join(parent);
                std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
                dir.join(&out_name)
            }
            None => dest_root.join(&out_name),
        };

        let mut volume = NiftiVolume::load(&entry.path).map_err(|e| e.to_string())?;
        volume.map_values_inplace(|v| map.apply(v));
        volume.save(&out_path).map_err(|e| e.to_string())?;
        Ok(())
    })
    .await;

    if !report.is_clean() {
        warn!(
            failed = report.failures.len(),
            processed = report.processed,
            "Remap batch finished with failures"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn write_volume(path: &Path, values: &[i32]) {
        let data = Array3::from_shape_vec((values.len(), 1, 1), values.to_vec())
            .unwrap()
            .into_dyn();
        NiftiVolume::from_data(data).save(path).unwrap();
    }

    #[test]
    fn zero_passes_through_unless_mapped() {
        let map = LabelMap::from_entries([(1, 95)]).unwrap();
        assert_eq!(map.apply(0), 0);
        assert_eq!(map.apply(1), 95);
        assert_eq!(map.apply(7), 0); // default background policy

        let map = LabelMap::from_entries([(0, 3)]).unwrap();
        assert_eq!(map.apply(0), 3);
    }

    #[test]
    fn preserve_policy_keeps_unmapped_values() {
        let map = LabelMap::from_entries([(1, 2)])
            .unwrap()
            .with_unmapped_policy(UnmappedPolicy::Preserve);
        assert_eq!(map.apply(9), 9);
    }

    #[test]
    fn duplicate_entries_are_rejected() {
        let err = LabelMap::from_entries([(1, 2), (1, 3)]).unwrap_err();
        assert!(matches!(err, RemapError::MalformedMap { .. }));
    }

    #[test]
    fn json_parsing_validates_keys_and_values() {
        let map = LabelMap::from_json_str("test", r#"{"101": 1, "200": 2}"#).unwrap();
        assert_eq!(map.apply(101), 1);
        assert_eq!(map.apply(200), 2);

        assert!(LabelMap::from_json_str("test", r#"{"abc": 1}"#).is_err());
        assert!(LabelMap::from_json_str("test", r#"{"1": "x"}"#).is_err());
    }

    #[test]
    fn swapped_targets() {
        let map = LabelMap::from_entries([(10, 4), (11, 5), (200, 2)]).unwrap();
        let swapped = map.with_swapped_targets(&[(4, 5)]);
        assert_eq!(swapped.apply(10), 5);
        assert_eq!(swapped.apply(11), 4);
        assert_eq!(swapped.apply(200), 2);
    }

    #[tokio::test]
    async fn remap_single_value_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        write_volume(&src.join("case_1.nii.gz"), &[0, 1, 1, 0, 1]);

        let map = LabelMap::from_json_str("inline", r#"{"1": 95}"#).unwrap();
        let report = remap_dir(&src, &dst, &map, None, false, 2).await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(report.is_clean());

        let out = NiftiVolume::load(&dst.join("case_1.nii.gz")).unwrap();
        let values: Vec<i32> = out.data().iter().copied().collect();
        assert_eq!(values, vec![0, 95, 95, 0, 95]);
    }

    #[tokio::test]
    async fn identity_map_is_byte_identical_and_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        write_volume(&src.join("v.nii.gz"), &[0, 1, 2, 3, 2, 1]);

        let map = LabelMap::identity(0..=3);
        let dst_a = dir.path().join("a");
        let dst_b = dir.path().join("b");
        remap_dir(&src, &dst_a, &map, None, false, 1).await.unwrap();
        remap_dir(&src, &dst_b, &map, None, false, 1).await.unwrap();

        let original = std::fs::read(src.join("v.nii.gz")).unwrap();
        let a = std::fs::read(dst_a.join("v.nii.gz")).unwrap();
        let b = std::fs::read(dst_b.join("v.nii.gz")).unwrap();
        assert_eq!(original, a);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn output_suffix_produces_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        write_volume(&src.join("case_7.nii.gz"), &[1]);

        let map = LabelMap::from_entries([(1, 2)]).unwrap();
        remap_dir(&src, &src, &map, Some("_sw"), false, 1)
            .await
            .unwrap();
        assert!(src.join("case_7.nii.gz").exists());
        assert!(src.join("case_7_sw.nii.gz").exists());
    }

    #[tokio::test]
    async fn corrupt_volume_fails_only_that_unit() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        write_volume(&src.join("good.nii.gz"), &[1, 0]);
        std::fs::write(src.join("bad.nii.gz"), b"not a volume").unwrap();

        let map = LabelMap::from_entries([(1, 5)]).unwrap();
        let report = remap_dir(&src, &dst, &map, None, false, 2).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("bad.nii.gz"));
        assert!(dst.join("good.nii.gz").exists());
    }

    #[tokio::test]
    async fn missing_source_dir_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let map = LabelMap::identity([1]);
        let err = remap_dir(
            &dir.path().join("nope"),
            &dir.path().join("out"),
            &map,
            None,
            false,
            1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RemapError::MissingSourceDir(_)));
    }
}
