//! Dataset assembler.
//!
//! Turns a raw image/label collection into a trainer-ready dataset folder:
//! staging under sanitized case keys, orphan reconciliation, geometric
//! normalization, vocabulary remapping, the deterministic train/test split,
//! optional augmentation, optional two-channel construction and finally the
//! dataset descriptor. Labels are staged into `labelsSrc/` and remapped from
//! there into `labelsTr/`, so no step ever rewrites its own input and
//! re-running over a complete tree is a no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{collect_volumes, process_volumes, BatchReport};
use crate::channels::{extract_alternate, ChannelError, ChannelSelection};
use crate::config::{ConfigError, Layout, PipelineConfig, VariantSpec};
use crate::dataset::case_key::{ExtractorChain, KeyError, KeyManifest};
use crate::dataset::descriptor::DescriptorError;
use crate::dataset::{case_channel_files, image_case_keys, label_case_keys, Dataset, DatasetDescriptor};
use crate::nifti::{stage_compressed, NiftiVolume, VolumeError};
use crate::remap::{remap_dir, RemapError};
use crate::resources::ResourceBudget;
use crate::transforms::{Augmenter, ImageTransforms, TransformError};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("Input directory not found: {0}")]
    MissingInputDir(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Remap(#[from] RemapError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-run knobs the assembler needs besides the variant itself.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
    pub variant: VariantSpec,
    pub seed: u64,
    pub test_fraction: f64,
    pub min_cases_for_split: usize,
    pub skip_augmentation: bool,
}

impl AssembleOptions {
    pub fn new(variant: VariantSpec, config: &PipelineConfig) -> Self {
        Self {
            variant,
            seed: config.seed,
            test_fraction: config.test_fraction,
            min_cases_for_split: config.min_cases_for_split,
            skip_augmentation: config.skip_augmentation,
        }
    }
}

/// Summary of one assembled dataset.
#[derive(Debug)]
pub struct AssembledDataset {
    pub dataset: Dataset,
    pub num_training: usize,
    pub num_test: usize,
    pub descriptor: DatasetDescriptor,
}

/// Builds trainer-ready dataset folders from raw collections.
pub struct Assembler {
    layout: Layout,
    budget: ResourceBudget,
    transforms: Arc<dyn ImageTransforms>,
    augmenter: Arc<dyn Augmenter>,
    extractor: ExtractorChain,
}

impl Assembler {
    pub fn new(
        layout: Layout,
        budget: ResourceBudget,
        transforms: Arc<dyn ImageTransforms>,
        augmenter: Arc<dyn Augmenter>,
    ) -> Self {
        Self {
            layout,
            budget,
            transforms,
            augmenter,
            extractor: ExtractorChain::default(),
        }
    }

    /// Runs the full assembly sequence for one variant.
    pub async fn assemble(
        &self,
        image_dir: &Path,
        label_dir: &Path,
        options: &AssembleOptions,
    ) -> Result<AssembledDataset, AssembleError> {
        let variant = &options.variant;
        let dataset = &variant.dataset;
        if !image_dir.is_dir() {
            return Err(AssembleError::MissingInputDir(image_dir.to_path_buf()));
        }
        if !label_dir.is_dir() {
            return Err(AssembleError::MissingInputDir(label_dir.to_path_buf()));
        }
        // Maps are parsed before any volume is touched; a malformed map must
        // not leave a half-built tree behind.
        let label_map = variant.label_map()?;
        let swapped_map = variant.swapped_label_map()?;

        let images_tr = self.layout.images_tr(dataset);
        let labels_tr = self.layout.labels_tr(dataset);
        let images_ts = self.layout.images_ts(dataset);
        let labels_ts = self.layout.labels_ts(dataset);
        let labels_src = self.layout.labels_src(dataset);
        for dir in [&images_tr, &labels_tr, &images_ts, &labels_ts, &labels_src] {
            std::fs::create_dir_all(dir)?;
        }

        info!(dataset = %dataset, "Assembling dataset");
        let jobs = self.budget.jobs;

        let staged_images = self
            .stage_collection(
                image_dir,
                &images_tr,
                &self.layout.key_manifest_images(dataset),
                "_0000",
            )
            .await?;
        let staged_labels = self
            .stage_collection(
                label_dir,
                &labels_src,
                &self.layout.key_manifest_labels(dataset),
                "",
            )
            .await?;
        info!(
            dataset = %dataset,
            images = staged_images,
            labels = staged_labels,
            "Staged raw cases"
        );

        reconcile(&images_tr, &labels_src)?;

        self.transforms
            .average_4d_to_3d(&images_tr, &images_tr, false, jobs)
            .await?;
        self.transforms
            .reorient_canonical(&images_tr, &images_tr, false, jobs)
            .await?;
        self.transforms
            .resample_isotropic(&images_tr, &images_tr, false, jobs)
            .await?;
        self.transforms
            .align_label_to_image(&images_tr, &labels_src, &labels_src, false, jobs)
            .await?;

        remap_dir(&labels_src, &labels_tr, &label_map, None, false, jobs).await?;
        // Units whose label failed to remap lose their images as well.
        reconcile(&images_tr, &labels_tr)?;

        let num_test = self.split(dataset, options)?;

        if variant.augmented && !options.skip_augmentation {
            info!(dataset = %dataset, "Running augmentation");
            self.augmenter
                .augment(&images_tr, &labels_tr, &variant.preserve_classes, jobs)
                .await?;
        }

        if variant.two_channel {
            self.build_second_channel(dataset, variant, &swapped_map)
                .await?;
        }

        let num_training = label_case_keys(&labels_tr)?.len();
        let mut descriptor = DatasetDescriptor::new(num_training, &variant.classes)?;
        if let Some(front) = variant.front_class {
            descriptor = descriptor.with_class_first(front);
        }
        descriptor.save(&self.layout.descriptor(dataset))?;
        info!(
            dataset = %dataset,
            training = num_training,
            test = num_test,
            "Dataset assembled"
        );

        Ok(AssembledDataset {
            dataset: dataset.clone(),
            num_training,
            num_test,
            descriptor,
        })
    }

    /// Copies every volume under `source` into `dest` under its case key.
    ///
    /// Existing destination files are left alone, so a collection already
    /// normalized by a previous run is not clobbered with raw copies.
    async fn stage_collection(
        &self,
        source: &Path,
        dest: &Path,
        manifest_path: &Path,
        channel_suffix: &str,
    ) -> Result<usize, AssembleError> {
        let mut manifest = KeyManifest::load_or_default(manifest_path)?;
        let entries = collect_volumes(source, false)?;

        // Key assignment is sequential (the manifest arbitrates collisions);
        // the copies themselves fan out over the worker budget.
        let mut targets: HashMap<PathBuf, PathBuf> = HashMap::new();
        for entry in &entries {
            let name = entry
                .relative
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            let candidate = self.extractor.extract(&entry.path)?;
            let key = manifest.assign(&name, &candidate);
            let out = dest.join(format!("{key}{channel_suffix}.nii.gz"));
            if !out.exists() {
                targets.insert(entry.path.clone(), out);
            }
        }
        manifest.save()?;

        let to_stage: Vec<_> = entries
            .into_iter()
            .filter(|e| targets.contains_key(&e.path))
            .collect();
        let staged = to_stage.len();
        let targets = Arc::new(targets);
        let report = process_volumes(to_stage, self.budget.jobs, move |entry| {
            let out = targets
                .get(&entry.path)
                .ok_or_else(|| "missing stage target".to_string())?;
            stage_compressed(&entry.path, out).map_err(|e| e.to_string())
        })
        .await;
        for failure in &report.failures {
            warn!(path = %failure.path.display(), reason = %failure.message, "Staging failed");
        }
        Ok(staged - report.failures.len())
    }

    /// Deterministic train/test split.
    ///
    /// Candidates are the original staged cases (never augmented or
    /// duplicated ones), shuffled with a seeded generator; the held-out
    /// cases move wholesale to `imagesTs`/`labelsTs`.
    fn split(&self, dataset: &Dataset, options: &AssembleOptions) -> Result<usize, AssembleError> {
        let images_tr = self.layout.images_tr(dataset);
        let labels_tr = self.layout.labels_tr(dataset);
        let images_ts = self.layout.images_ts(dataset);
        let labels_ts = self.layout.labels_ts(dataset);

        let originals = label_case_keys(&self.layout.labels_src(dataset))?;
        let present = label_case_keys(&labels_tr)?;
        let mut keys: Vec<String> = originals.intersection(&present).cloned().collect();

        let total = originals.len();
        let num_test = if total < options.min_cases_for_split {
            0
        } else {
            (total as f64 * options.test_fraction).floor() as usize
        };
        if num_test == 0 {
            info!(dataset = %dataset, cases = total, "Collection kept whole, no test split");
            return Ok(0);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(options.seed.wrapping_add(dataset.id as u64));
        keys.shuffle(&mut rng);
        let test_keys = &keys[..num_test.min(keys.len())];

        for key in test_keys {
            let label = labels_tr.join(format!("{key}.nii.gz"));
            if label.exists() {
                std::fs::rename(&label, labels_ts.join(format!("{key}.nii.gz")))?;
            }
            for channel in case_channel_files(&images_tr, key)? {
                let name = channel.file_name().unwrap_or_default().to_os_string();
                std::fs::rename(&channel, images_ts.join(name))?;
            }
        }
        info!(dataset = %dataset, held_out = test_keys.len(), "Applied train/test split");
        Ok(test_keys.len())
    }

    /// Builds the auxiliary `_0001` channel and the swapped duplicate cases.
    async fn build_second_channel(
        &self,
        dataset: &Dataset,
        variant: &VariantSpec,
        swapped_map: &crate::remap::LabelMap,
    ) -> Result<(), AssembleError> {
        let jobs = self.budget.jobs;
        let images_tr = self.layout.images_tr(dataset);
        let labels_tr = self.layout.labels_tr(dataset);
        let images_ts = self.layout.images_ts(dataset);
        let labels_src = self.layout.labels_src(dataset);

        let primary = ChannelSelection::new(variant.alt_range.clone(), variant.alt_priority.clone());
        let swapped = ChannelSelection::new(
            variant.alt_range.clone(),
            variant.alt_priority_swapped.clone(),
        );

        // Auxiliary channels are derived for every staged case, test cases
        // included; the trainer needs both channels at inference time.
        extract_alternate(&labels_src, &images_tr, &primary, "_0001", false, jobs).await?;
        let test_keys = image_case_keys(&images_ts)?;
        for key in &test_keys {
            let aux = images_tr.join(format!("{key}_0001.nii.gz"));
            if aux.exists() {
                std::fs::rename(&aux, images_ts.join(format!("{key}_0001.nii.gz")))?;
            }
        }

        // Duplicated training cases with the complementary channel and the
        // swapped class targets, keyed `<key>_sw`.
        extract_alternate(&labels_src, &images_tr, &swapped, "_sw_0001", false, jobs).await?;
        remap_dir(&labels_src, &labels_tr, swapped_map, Some("_sw"), false, jobs).await?;
        for key in label_case_keys(&labels_src)? {
            if test_keys.contains(&key) {
                // Held-out cases are not duplicated.
                for stale in [
                    images_tr.join(format!("{key}_sw_0001.nii.gz")),
                    labels_tr.join(format!("{key}_sw.nii.gz")),
                ] {
                    if stale.exists() {
                        std::fs::remove_file(&stale)?;
                    }
                }
                continue;
            }
            let primary_src = images_tr.join(format!("{key}_0000.nii.gz"));
            let primary_dst = images_tr.join(format!("{key}_sw_0000.nii.gz"));
            if primary_src.exists() {
                std::fs::copy(&primary_src, &primary_dst)?;
            }
        }

        // The extracted channels inherit label geometry; copy the primary
        // image's header onto each so the trainer sees consistent metadata.
        for dir in [&images_tr, &images_ts] {
            let report = repair_channel_geometry(dir, jobs).await?;
            for failure in &report.failures {
                warn!(
                    path = %failure.path.display(),
                    reason = %failure.message,
                    "Channel geometry repair failed"
                );
            }
        }
        Ok(())
    }
}

/// Deletes cases present on only one side of an image/label pairing.
pub fn reconcile(images_dir: &Path, labels_dir: &Path) -> Result<usize, std::io::Error> {
    let image_keys = image_case_keys(images_dir)?;
    let label_keys = label_case_keys(labels_dir)?;
    let mut removed = 0;

    for key in image_keys.difference(&label_keys) {
        for file in case_channel_files(images_dir, key)? {
            warn!(case = %key, file = %file.display(), "Removing image without label");
            std::fs::remove_file(&file)?;
            removed += 1;
        }
    }
    for key in label_keys.difference(&image_keys) {
        let file = labels_dir.join(format!("{key}.nii.gz"));
        if file.exists() {
            warn!(case = %key, file = %file.display(), "Removing label without image");
            std::fs::remove_file(&file)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Copies each case's primary-channel header onto its auxiliary channels.
async fn repair_channel_geometry(dir: &Path, workers: usize) -> Result<BatchReport, std::io::Error> {
    let entries: Vec<_> = collect_volumes(dir, false)?
        .into_iter()
        .filter(|e| {
            let name = e.relative.file_name().unwrap_or_default().to_string_lossy();
            crate::nifti::volume_stem(&name)
                .map(|stem| stem.ends_with("_0001"))
                .unwrap_or(false)
        })
        .collect();
    let dir = dir.to_path_buf();
    Ok(process_volumes(entries, workers, move |entry| {
        let name = entry.relative.file_name().unwrap_or_default().to_string_lossy();
        let stem = crate::nifti::volume_stem(&name).ok_or_else(|| "bad name".to_string())?;
        let base = stem.strip_suffix("_0001").ok_or_else(|| "bad name".to_string())?;
        let primary_path = dir.join(format!("{base}_0000.nii.gz"));
        if !primary_path.exists() {
            return Err(format!("no primary channel for '{stem}'"));
        }
        let primary = NiftiVolume::load(&primary_path).map_err(|e| e.to_string())?;
        let mut aux = NiftiVolume::load(&entry.path).map_err(|e| e.to_string())?;
        aux.adopt_geometry_from(&primary).map_err(|e| e.to_string())?;
        aux.save(&entry.path).map_err(|e| e.to_string())
    })
    .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Device;
    use crate::transforms::{NoopAugmenter, NoopTransforms};
    use ndarray::Array3;

    fn write_volume(path: &Path, values: &[i32]) {
        let data = Array3::from_shape_vec((values.len(), 1, 1), values.to_vec())
            .unwrap()
            .into_dyn();
        NiftiVolume::from_data(data).save(path).unwrap();
    }

    fn test_budget() -> ResourceBudget {
        ResourceBudget {
            jobs: 2,
            jobs_for_training: 1,
            device: Device::Cpu,
        }
    }

    fn assembler(root: &Path) -> Assembler {
        Assembler::new(
            Layout::new(root),
            test_budget(),
            Arc::new(NoopTransforms),
            Arc::new(NoopAugmenter),
        )
    }

    fn options(variant: VariantSpec) -> AssembleOptions {
        AssembleOptions {
            variant,
            seed: 42,
            test_fraction: 0.10,
            min_cases_for_split: 10,
            skip_augmentation: false,
        }
    }

    #[tokio::test]
    async fn assembles_paired_cases_and_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("in_images");
        let labels = dir.path().join("in_labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();

        write_volume(&images.join("Case10.nii.gz"), &[100, 200, 300]);
        write_volume(&images.join("Case11.nii.gz"), &[100, 100, 100]);
        // No label for case 12: the image is an orphan.
        write_volume(&images.join("Case12.nii.gz"), &[50, 50, 50]);
        write_volume(&labels.join("mask_case10.nii.gz"), &[101, 200, 0]);
        write_volume(&labels.join("mask_case11.nii.gz"), &[0, 63, 201]);

        let root = dir.path().join("work");
        let asm = assembler(&root);
        let opts = options(VariantSpec::step1());
        let result = asm.assemble(&images, &labels, &opts).await.unwrap();
        assert_eq!(result.num_training, 2);
        assert_eq!(result.num_test, 0);

        let ds = &opts.variant.dataset;
        let layout = Layout::new(&root);
        assert!(layout.images_tr(ds).join("case_10_0000.nii.gz").exists());
        assert!(layout.images_tr(ds).join("case_11_0000.nii.gz").exists());
        assert!(!layout.images_tr(ds).join("case_12_0000.nii.gz").exists());

        // Labels arrive remapped into the step-1 vocabulary.
        let label = NiftiVolume::load(&layout.labels_tr(ds).join("case_10.nii.gz")).unwrap();
        let values: Vec<i32> = label.data().iter().copied().collect();
        assert_eq!(values, vec![1, 2, 0]);
        let label = NiftiVolume::load(&layout.labels_tr(ds).join("case_11.nii.gz")).unwrap();
        let values: Vec<i32> = label.data().iter().copied().collect();
        assert_eq!(values, vec![0, 6, 3]);

        let descriptor = DatasetDescriptor::load(&layout.descriptor(ds)).unwrap();
        assert_eq!(descriptor.num_training, 2);
        assert_eq!(descriptor.regions_class_order[0], 1);
    }

    #[tokio::test]
    async fn split_is_deterministic_and_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("in_images");
        let labels = dir.path().join("in_labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        for i in 0..20 {
            write_volume(&images.join(format!("scan{i:02}.nii.gz")), &[100]);
            write_volume(&labels.join(format!("seg{i:02}.nii.gz")), &[200]);
        }

        let mut held_out = Vec::new();
        for run in 0..2 {
            let root = dir.path().join(format!("work{run}"));
            let asm = assembler(&root);
            let opts = options(VariantSpec::step1());
            let result = asm.assemble(&images, &labels, &opts).await.unwrap();
            assert_eq!(result.num_test, 2);
            assert_eq!(result.num_training, 18);

            let ds = &opts.variant.dataset;
            let layout = Layout::new(&root);
            let train = label_case_keys(&layout.labels_tr(ds)).unwrap();
            let test = label_case_keys(&layout.labels_ts(ds)).unwrap();
            assert!(train.is_disjoint(&test));
            // Every held-out label has its image channel alongside it.
            for key in &test {
                assert!(layout
                    .images_ts(ds)
                    .join(format!("{key}_0000.nii.gz"))
                    .exists());
            }
            held_out.push(test);
        }
        assert_eq!(held_out[0], held_out[1]);
    }

    #[tokio::test]
    async fn rerun_over_complete_tree_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("in_images");
        let labels = dir.path().join("in_labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        write_volume(&images.join("Case1.nii.gz"), &[100, 200]);
        write_volume(&labels.join("Case1_seg.nii.gz"), &[101, 0]);

        let root = dir.path().join("work");
        let asm = assembler(&root);
        let opts = options(VariantSpec::step1());
        asm.assemble(&images, &labels, &opts).await.unwrap();

        let ds = &opts.variant.dataset;
        let layout = Layout::new(&root);
        let label_path = layout.labels_tr(ds).join("case_1.nii.gz");
        let image_path = layout.images_tr(ds).join("case_1_0000.nii.gz");
        let first = (
            std::fs::read(&label_path).unwrap(),
            std::fs::read(&image_path).unwrap(),
        );

        asm.assemble(&images, &labels, &opts).await.unwrap();
        let second = (
            std::fs::read(&label_path).unwrap(),
            std::fs::read(&image_path).unwrap(),
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn two_channel_variant_duplicates_swapped_cases() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("in_images");
        let labels = dir.path().join("in_labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        write_volume(&images.join("Case1.nii.gz"), &[100, 100, 100, 100]);
        // 63 odd disc, 64 even disc, plus cord.
        write_volume(&labels.join("Case1_seg.nii.gz"), &[63, 64, 200, 0]);

        let root = dir.path().join("work");
        let asm = assembler(&root);
        let opts = options(VariantSpec::step2());
        let result = asm.assemble(&images, &labels, &opts).await.unwrap();
        // Original plus swapped duplicate.
        assert_eq!(result.num_training, 2);

        let ds = &opts.variant.dataset;
        let layout = Layout::new(&root);
        let images_tr = layout.images_tr(ds);
        for name in [
            "case_1_0000.nii.gz",
            "case_1_0001.nii.gz",
            "case_1_sw_0000.nii.gz",
            "case_1_sw_0001.nii.gz",
        ] {
            assert!(images_tr.join(name).exists(), "missing {name}");
        }

        // Primary aux keeps even instances, swapped aux the odd ones.
        let aux = NiftiVolume::load(&images_tr.join("case_1_0001.nii.gz")).unwrap();
        let values: Vec<i32> = aux.data().iter().copied().collect();
        assert_eq!(values, vec![0, 64, 0, 0]);
        let aux = NiftiVolume::load(&images_tr.join("case_1_sw_0001.nii.gz")).unwrap();
        let values: Vec<i32> = aux.data().iter().copied().collect();
        assert_eq!(values, vec![63, 0, 0, 0]);

        // The swapped label exchanges the disc parity classes.
        let label = NiftiVolume::load(&layout.labels_tr(ds).join("case_1.nii.gz")).unwrap();
        let values: Vec<i32> = label.data().iter().copied().collect();
        assert_eq!(values, vec![7, 8, 2, 0]);
        let label = NiftiVolume::load(&layout.labels_tr(ds).join("case_1_sw.nii.gz")).unwrap();
        let values: Vec<i32> = label.data().iter().copied().collect();
        assert_eq!(values, vec![8, 7, 2, 0]);
    }

    #[tokio::test]
    async fn missing_input_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let asm = assembler(&dir.path().join("work"));
        let err = asm
            .assemble(
                &dir.path().join("nope"),
                &dir.path().join("also_nope"),
                &options(VariantSpec::step1()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AssembleError::MissingInputDir(_)));
    }

    #[test]
    fn reconcile_removes_both_orphan_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        let labels = dir.path().join("labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        for name in ["case_1_0000.nii.gz", "case_2_0000.nii.gz"] {
            std::fs::write(images.join(name), b"x").unwrap();
        }
        for name in ["case_1.nii.gz", "case_3.nii.gz"] {
            std::fs::write(labels.join(name), b"x").unwrap();
        }

        let removed = reconcile(&images, &labels).unwrap();
        assert_eq!(removed, 2);
        assert!(images.join("case_1_0000.nii.gz").exists());
        assert!(!images.join("case_2_0000.nii.gz").exists());
        assert!(labels.join("case_1.nii.gz").exists());
        assert!(!labels.join("case_3.nii.gz").exists());
    }
}
