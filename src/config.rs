//! Pipeline configuration and on-disk layout.
//!
//! One immutable [`PipelineConfig`] is constructed at startup (builder
//! methods or environment variables) and passed by reference into every
//! component; there is no ambient global state. [`Layout`] is the single
//! source of truth for the persisted state tree.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::dataset::Dataset;
use crate::remap::{LabelMap, RemapError};
use crate::resources::Device;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A built-in or user-supplied label map is malformed.
    #[error(transparent)]
    LabelMap(#[from] RemapError),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for a whole pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the persisted state tree (`raw/`, `preprocessed/`, ...).
    pub work_dir: PathBuf,
    /// Seed for the deterministic train/test shuffle.
    pub seed: u64,
    /// Requested general worker count; clamped by the allocator.
    pub requested_jobs: Option<usize>,
    /// Requested training worker count; clamped by the allocator.
    pub requested_train_jobs: Option<usize>,
    /// Forced compute device, bypassing GPU detection.
    pub device_override: Option<Device>,
    /// Trainer class name passed to the segmentation trainer.
    pub trainer_name: String,
    /// Experiment planner name.
    pub planner_name: String,
    /// Plan identifier.
    pub plan_name: String,
    /// Training configuration (e.g. `3d_fullres`).
    pub configuration: String,
    /// Cross-validation fold to train.
    pub fold: u8,
    /// Fraction of cases held out for test.
    pub test_fraction: f64,
    /// Collections smaller than this are not split at all.
    pub min_cases_for_split: usize,
    /// Skip the augmentation step even for augmented variants.
    pub skip_augmentation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./spineforge-data"),
            seed: 42,
            requested_jobs: None,
            requested_train_jobs: None,
            device_override: None,
            trainer_name: "nnUNetTrainer".to_string(),
            planner_name: "ExperimentPlanner".to_string(),
            plan_name: "nnUNetPlans".to_string(),
            configuration: "3d_fullres".to_string(),
            fold: 0,
            test_fraction: 0.10,
            min_cases_for_split: 10,
            skip_augmentation: false,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_requested_jobs(mut self, jobs: Option<usize>) -> Self {
        self.requested_jobs = jobs;
        self
    }

    pub fn with_requested_train_jobs(mut self, jobs: Option<usize>) -> Self {
        self.requested_train_jobs = jobs;
        self
    }

    pub fn with_device_override(mut self, device: Option<Device>) -> Self {
        self.device_override = device;
        self
    }

    pub fn with_fold(mut self, fold: u8) -> Self {
        self.fold = fold;
        self
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = configuration.into();
        self
    }

    pub fn with_skip_augmentation(mut self, skip: bool) -> Self {
        self.skip_augmentation = skip;
        self
    }

    /// Reads overrides from `SPINEFORGE_*` environment variables.
    ///
    /// Recognized: `SPINEFORGE_WORK_DIR`, `SPINEFORGE_SEED`,
    /// `SPINEFORGE_JOBS`, `SPINEFORGE_TRAIN_JOBS`, `SPINEFORGE_DEVICE`,
    /// `SPINEFORGE_FOLD`, `SPINEFORGE_CONFIGURATION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("SPINEFORGE_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(seed) = parse_env("SPINEFORGE_SEED")? {
            config.seed = seed;
        }
        if let Some(jobs) = parse_env("SPINEFORGE_JOBS")? {
            config.requested_jobs = Some(jobs);
        }
        if let Some(jobs) = parse_env("SPINEFORGE_TRAIN_JOBS")? {
            config.requested_train_jobs = Some(jobs);
        }
        if let Ok(device) = std::env::var("SPINEFORGE_DEVICE") {
            let device = device
                .parse::<Device>()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "SPINEFORGE_DEVICE".to_string(),
                    message,
                })?;
            config.device_override = Some(device);
        }
        if let Some(fold) = parse_env("SPINEFORGE_FOLD")? {
            config.fold = fold;
        }
        if let Ok(configuration) = std::env::var("SPINEFORGE_CONFIGURATION") {
            config.configuration = configuration;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(ConfigError::ValidationFailed(format!(
                "test_fraction must be in [0, 1), got {}",
                self.test_fraction
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.work_dir)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("cannot parse '{raw}'"),
            }),
        Err(_) => Ok(None),
    }
}

/// The persisted state tree.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn preprocessed(&self) -> PathBuf {
        self.root.join("preprocessed")
    }

    pub fn results(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn exports(&self) -> PathBuf {
        self.root.join("exports")
    }

    pub fn dataset_raw(&self, dataset: &Dataset) -> PathBuf {
        self.raw().join(dataset.folder_name())
    }

    pub fn images_tr(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("imagesTr")
    }

    pub fn labels_tr(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("labelsTr")
    }

    pub fn images_ts(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("imagesTs")
    }

    pub fn labels_ts(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("labelsTs")
    }

    /// Staged source-vocabulary labels, kept so remapping never runs in place.
    pub fn labels_src(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("labelsSrc")
    }

    /// Key manifest for the image collection.
    ///
    /// Images and labels keep separate manifests: a matched image/label pair
    /// legitimately shares one case key, which must not count as a collision.
    pub fn key_manifest_images(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("case_manifest_images.json")
    }

    /// Key manifest for the label collection.
    pub fn key_manifest_labels(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("case_manifest_labels.json")
    }

    pub fn descriptor(&self, dataset: &Dataset) -> PathBuf {
        self.dataset_raw(dataset).join("dataset.json")
    }

    pub fn preprocessed_dataset(&self, dataset: &Dataset) -> PathBuf {
        self.preprocessed().join(dataset.folder_name())
    }

    pub fn fingerprint(&self, dataset: &Dataset) -> PathBuf {
        self.preprocessed_dataset(dataset)
            .join("dataset_fingerprint.json")
    }

    pub fn plan_file(&self, dataset: &Dataset, plan: &str) -> PathBuf {
        self.preprocessed_dataset(dataset).join(format!("{plan}.json"))
    }

    pub fn preprocessed_config(
        &self,
        dataset: &Dataset,
        plan: &str,
        configuration: &str,
    ) -> PathBuf {
        self.preprocessed_dataset(dataset)
            .join(format!("{plan}_{configuration}"))
    }

    pub fn splits_file(&self, dataset: &Dataset) -> PathBuf {
        self.preprocessed_dataset(dataset).join("splits_final.json")
    }

    pub fn results_run(
        &self,
        dataset: &Dataset,
        trainer: &str,
        plan: &str,
        configuration: &str,
    ) -> PathBuf {
        self.results()
            .join(dataset.folder_name())
            .join(format!("{trainer}__{plan}__{configuration}"))
    }

    pub fn fold_dir(
        &self,
        dataset: &Dataset,
        trainer: &str,
        plan: &str,
        configuration: &str,
        fold: u8,
    ) -> PathBuf {
        self.results_run(dataset, trainer, plan, configuration)
            .join(format!("fold_{fold}"))
    }

    /// Key identifying one `dataset x trainer x plan x configuration x fold`.
    pub fn run_key(
        &self,
        dataset: &Dataset,
        trainer: &str,
        plan: &str,
        configuration: &str,
        fold: u8,
    ) -> String {
        format!(
            "{}__{trainer}__{plan}__{configuration}__fold_{fold}",
            dataset.folder_name()
        )
    }

    pub fn model_export(
        &self,
        dataset: &Dataset,
        trainer: &str,
        plan: &str,
        configuration: &str,
        fold: u8,
    ) -> PathBuf {
        self.exports().join(format!(
            "{}.model.zip",
            self.run_key(dataset, trainer, plan, configuration, fold)
        ))
    }

    pub fn package_archive(
        &self,
        dataset: &Dataset,
        trainer: &str,
        plan: &str,
        configuration: &str,
        fold: u8,
    ) -> PathBuf {
        self.exports().join(format!(
            "{}.tar.gz",
            self.run_key(dataset, trainer, plan, configuration, fold)
        ))
    }

    pub fn predictions_dir(
        &self,
        dataset: &Dataset,
        trainer: &str,
        plan: &str,
        configuration: &str,
        fold: u8,
    ) -> PathBuf {
        self.fold_dir(dataset, trainer, plan, configuration, fold)
            .join("test_predictions")
    }
}

/// Built-in label map tables, shipped with the crate.
pub mod tables {
    pub const STEP1_LABEL_MAP: &str = include_str!("../resources/labels_maps/step1.json");
    pub const STEP2_LABEL_MAP: &str = include_str!("../resources/labels_maps/step2.json");
}

/// Declarative description of one dataset variant to assemble.
#[derive(Debug, Clone)]
pub struct VariantSpec {
    pub dataset: Dataset,
    /// Label map JSON (flat object, string keys).
    pub label_map_json: &'static str,
    /// Class-pair targets swapped for the duplicated two-channel cases.
    pub swap_pairs: Vec<(i32, i32)>,
    /// Class vocabulary for the descriptor, excluding background.
    pub classes: Vec<(&'static str, i32)>,
    /// Class moved to the front of the printed metric order.
    pub front_class: Option<i32>,
    /// Whether this variant carries a second input channel per case.
    pub two_channel: bool,
    /// Whether the augmentation collaborator runs for this variant.
    pub augmented: bool,
    /// Instance-value range of the auxiliary channel source labels.
    pub alt_range: std::ops::RangeInclusive<i32>,
    /// Instance values retained in the primary auxiliary channel.
    pub alt_priority: Vec<i32>,
    /// Complementary values for the swapped auxiliary channel.
    pub alt_priority_swapped: Vec<i32>,
    /// Label classes preserved during augmentation.
    pub preserve_classes: Vec<i32>,
}

impl VariantSpec {
    /// Step-1 localization variant: grouped odd/even classes, single channel.
    pub fn step1() -> Self {
        Self {
            dataset: Dataset::new(101, "TotalSpineSeg_step1"),
            label_map_json: tables::STEP1_LABEL_MAP,
            swap_pairs: vec![(4, 5), (6, 7)],
            classes: vec![
                ("LDH", 1),
                ("spinal_cord", 2),
                ("spinal_canal", 3),
                ("vertebrae_odd", 4),
                ("vertebrae_even", 5),
                ("disc_odd", 6),
                ("disc_even", 7),
                ("sacrum", 8),
            ],
            front_class: Some(1),
            two_channel: false,
            augmented: false,
            alt_range: 63..=87,
            alt_priority: (63..=87).filter(|v| v % 2 == 0).collect(),
            alt_priority_swapped: (63..=87).filter(|v| v % 2 != 0).collect(),
            preserve_classes: vec![1],
        }
    }

    /// Step-2 variant: two input channels, duplicated swapped cases.
    pub fn step2() -> Self {
        Self {
            dataset: Dataset::new(102, "TotalSpineSeg_step2"),
            label_map_json: tables::STEP2_LABEL_MAP,
            swap_pairs: vec![(5, 6), (7, 8)],
            classes: vec![
                ("LDH", 1),
                ("spinal_cord", 2),
                ("spinal_canal", 3),
                ("sacrum", 4),
                ("vertebrae_odd", 5),
                ("vertebrae_even", 6),
                ("disc_odd", 7),
                ("disc_even", 8),
                ("vertebrae_c1", 9),
                ("vertebrae_c2", 10),
            ],
            front_class: Some(1),
            two_channel: true,
            augmented: false,
            alt_range: 63..=87,
            alt_priority: (63..=87).filter(|v| v % 2 == 0).collect(),
            alt_priority_swapped: (63..=87).filter(|v| v % 2 != 0).collect(),
            preserve_classes: vec![1],
        }
    }

    /// Augmented derivative of a base variant.
    pub fn augmented_from(base: &VariantSpec, id: u16) -> Self {
        let mut variant = base.clone();
        variant.dataset = Dataset::derived_from(
            id,
            format!("{}_aug", base.dataset.name),
            base.dataset.id,
        );
        variant.augmented = true;
        variant
    }

    /// Two-channel derivative of a base variant.
    pub fn two_channel_from(base: &VariantSpec, id: u16) -> Self {
        let mut variant = base.clone();
        variant.dataset = Dataset::derived_from(
            id,
            format!("{}_2ch", base.dataset.name),
            base.dataset.id,
        );
        variant.two_channel = true;
        variant
    }

    /// Full derivative: augmented and two-channel.
    pub fn full_from(base: &VariantSpec, id: u16) -> Self {
        let mut variant = base.clone();
        variant.dataset = Dataset::derived_from(
            id,
            format!("{}_full", base.dataset.name),
            base.dataset.id,
        );
        variant.augmented = true;
        variant.two_channel = true;
        variant
    }

    /// Parses the variant's label map, validating it before any volume is
    /// touched.
    pub fn label_map(&self) -> Result<LabelMap, ConfigError> {
        Ok(LabelMap::from_json_str(
            &format!("{} label map", self.dataset.folder_name()),
            self.label_map_json,
        )?)
    }

    /// The swapped counterpart map for duplicated cases.
    pub fn swapped_label_map(&self) -> Result<LabelMap, ConfigError> {
        Ok(self.label_map()?.with_swapped_targets(&self.swap_pairs))
    }
}

/// The default variant set for a full run.
pub fn default_variants() -> Vec<VariantSpec> {
    vec![VariantSpec::step1(), VariantSpec::step2()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = PipelineConfig::new()
            .with_work_dir("/tmp/sf")
            .with_seed(7)
            .with_requested_jobs(Some(4))
            .with_fold(2)
            .with_configuration("3d_lowres");
        assert_eq!(config.work_dir, PathBuf::from("/tmp/sf"));
        assert_eq!(config.seed, 7);
        assert_eq!(config.requested_jobs, Some(4));
        assert_eq!(config.fold, 2);
        assert_eq!(config.configuration, "3d_lowres");
    }

    #[test]
    fn layout_paths() {
        let layout = Layout::new("/data");
        let ds = Dataset::new(102, "TotalSpineSeg_step2");
        assert_eq!(
            layout.images_tr(&ds),
            PathBuf::from("/data/raw/Dataset102_TotalSpineSeg_step2/imagesTr")
        );
        assert_eq!(
            layout.fold_dir(&ds, "nnUNetTrainer", "nnUNetPlans", "3d_fullres", 0),
            PathBuf::from(
                "/data/results/Dataset102_TotalSpineSeg_step2/nnUNetTrainer__nnUNetPlans__3d_fullres/fold_0"
            )
        );
        assert_eq!(
            layout.run_key(&ds, "nnUNetTrainer", "nnUNetPlans", "3d_fullres", 0),
            "Dataset102_TotalSpineSeg_step2__nnUNetTrainer__nnUNetPlans__3d_fullres__fold_0"
        );
    }

    #[test]
    fn builtin_label_maps_parse() {
        for variant in default_variants() {
            let map = variant.label_map().unwrap();
            assert!(!map.is_empty());
            // LDH always maps to class 1
            assert_eq!(map.apply(101), 1);
            let swapped = variant.swapped_label_map().unwrap();
            assert_eq!(swapped.apply(101), 1);
        }
    }

    #[test]
    fn step1_swap_exchanges_parity_classes() {
        let variant = VariantSpec::step1();
        let map = variant.label_map().unwrap();
        let swapped = variant.swapped_label_map().unwrap();
        // 63 is an odd disc instance: class 6 primary, class 7 swapped
        assert_eq!(map.apply(63), 6);
        assert_eq!(swapped.apply(63), 7);
        // cord unaffected
        assert_eq!(map.apply(200), 2);
        assert_eq!(swapped.apply(200), 2);
    }

    #[test]
    fn priority_lists_are_complementary() {
        let variant = VariantSpec::step2();
        for v in 63..=87 {
            let in_primary = variant.alt_priority.contains(&v);
            let in_swapped = variant.alt_priority_swapped.contains(&v);
            assert!(in_primary != in_swapped);
        }
    }

    #[test]
    fn derived_variants_reference_their_source() {
        let base = VariantSpec::step1();
        let aug = VariantSpec::augmented_from(&base, 103);
        assert!(aug.augmented);
        assert_eq!(aug.dataset.source, Some(101));
        let full = VariantSpec::full_from(&base, 104);
        assert!(full.augmented && full.two_channel);
    }
}
