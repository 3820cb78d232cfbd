//! End-to-end pipeline tests: assembly from raw collections followed by the
//! stage sequence against a recording trainer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::Array3;

use spineforge::config::{Layout, PipelineConfig, VariantSpec};
use spineforge::dataset::{image_case_keys, label_case_keys, AssembleOptions, Assembler, Dataset};
use spineforge::nifti::NiftiVolume;
use spineforge::resources::{Device, ResourceBudget};
use spineforge::stages::StageExecutor;
use spineforge::trainer::{SegmentationTrainer, TrainerError};
use spineforge::transforms::{NoopAugmenter, NoopTransforms};

fn write_volume(path: &Path, values: &[i32]) {
    let data = Array3::from_shape_vec((values.len(), 1, 1), values.to_vec())
        .unwrap()
        .into_dyn();
    NiftiVolume::from_data(data).save(path).unwrap();
}

fn budget() -> ResourceBudget {
    ResourceBudget {
        jobs: 2,
        jobs_for_training: 1,
        device: Device::Cpu,
    }
}

fn assembler(root: &Path) -> Assembler {
    Assembler::new(
        Layout::new(root),
        budget(),
        Arc::new(NoopTransforms),
        Arc::new(NoopAugmenter),
    )
}

#[tokio::test]
async fn unmatched_cases_are_reconciled_away() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let labels = dir.path().join("labels");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&labels).unwrap();
    write_volume(&images.join("Case10.nii.gz"), &[100, 200]);
    write_volume(&labels.join("mask_case10.nii.gz"), &[101, 0]);
    // Case 11 has no mask.
    write_volume(&images.join("Case11.nii.gz"), &[100, 100]);

    let root = dir.path().join("work");
    let config = PipelineConfig::new().with_work_dir(&root);
    let options = AssembleOptions::new(VariantSpec::step1(), &config);
    let result = assembler(&root)
        .assemble(&images, &labels, &options)
        .await
        .unwrap();
    assert_eq!(result.num_training, 1);

    let layout = Layout::new(&root);
    let ds = &options.variant.dataset;
    let image_keys = image_case_keys(&layout.images_tr(ds)).unwrap();
    let label_keys = label_case_keys(&layout.labels_tr(ds)).unwrap();
    assert_eq!(image_keys, label_keys);
    assert_eq!(
        image_keys.into_iter().collect::<Vec<_>>(),
        vec!["case_10".to_string()]
    );
}

#[tokio::test]
async fn split_partitions_the_collection() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let labels = dir.path().join("labels");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&labels).unwrap();
    let total = 25;
    for i in 0..total {
        write_volume(&images.join(format!("sub{i:03}.nii.gz")), &[100]);
        write_volume(&labels.join(format!("sub{i:03}_seg.nii.gz")), &[101]);
    }

    let root = dir.path().join("work");
    let config = PipelineConfig::new().with_work_dir(&root);
    let options = AssembleOptions::new(VariantSpec::step1(), &config);
    let result = assembler(&root)
        .assemble(&images, &labels, &options)
        .await
        .unwrap();
    // floor(0.10 x 25) = 2 held out.
    assert_eq!(result.num_test, 2);
    assert_eq!(result.num_training, total - 2);

    let layout = Layout::new(&root);
    let ds = &options.variant.dataset;
    let train = label_case_keys(&layout.labels_tr(ds)).unwrap();
    let test = label_case_keys(&layout.labels_ts(ds)).unwrap();
    assert!(train.is_disjoint(&test));
    let union: BTreeSet<_> = train.union(&test).cloned().collect();
    assert_eq!(union.len(), total);

    // Both collections still pair images with labels.
    assert_eq!(image_case_keys(&layout.images_tr(ds)).unwrap(), train);
    assert_eq!(image_case_keys(&layout.images_ts(ds)).unwrap(), test);
}

/// Trainer that counts invocations and writes the expected artifacts.
struct RecordingTrainer {
    layout: Layout,
    config: PipelineConfig,
    dataset: Dataset,
    invocations: Mutex<usize>,
}

impl RecordingTrainer {
    fn new(config: &PipelineConfig, dataset: &Dataset) -> Self {
        Self {
            layout: config.layout(),
            config: config.clone(),
            dataset: dataset.clone(),
            invocations: Mutex::new(0),
        }
    }

    fn count(&self) -> usize {
        *self.invocations.lock().unwrap()
    }

    fn bump(&self) {
        *self.invocations.lock().unwrap() += 1;
    }

    fn touch(path: &PathBuf) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"artifact").unwrap();
    }
}

#[async_trait]
impl SegmentationTrainer for RecordingTrainer {
    async fn extract_fingerprint(
        &self,
        _dataset_id: u16,
        _workers: usize,
    ) -> Result<(), TrainerError> {
        self.bump();
        Self::touch(&self.layout.fingerprint(&self.dataset));
        Ok(())
    }

    async fn plan_experiment(
        &self,
        _dataset_id: u16,
        _planner: &str,
        _plan: &str,
    ) -> Result<(), TrainerError> {
        self.bump();
        Self::touch(&self.layout.plan_file(&self.dataset, &self.config.plan_name));
        Ok(())
    }

    async fn preprocess(
        &self,
        _dataset_id: u16,
        plan: &str,
        configuration: &str,
        _workers: usize,
    ) -> Result<(), TrainerError> {
        self.bump();
        let dir = self
            .layout
            .preprocessed_config(&self.dataset, plan, configuration);
        for key in label_case_keys(&self.layout.labels_tr(&self.dataset)).unwrap() {
            Self::touch(&dir.join(format!("{key}.npz")));
            Self::touch(&dir.join(format!("{key}.pkl")));
        }
        Ok(())
    }

    async fn train(
        &self,
        _dataset_id: u16,
        configuration: &str,
        fold: u8,
        trainer_name: &str,
        plan: &str,
        _device: Device,
        _use_cached_decompressed: bool,
    ) -> Result<(), TrainerError> {
        self.bump();
        Self::touch(
            &self
                .layout
                .fold_dir(&self.dataset, trainer_name, plan, configuration, fold)
                .join("checkpoint_final.pth"),
        );
        Ok(())
    }

    async fn export_model(
        &self,
        _dataset_id: u16,
        out_path: &Path,
        _configuration: &str,
        _fold: u8,
        _trainer_name: &str,
        _plan: &str,
    ) -> Result<(), TrainerError> {
        self.bump();
        Self::touch(&out_path.to_path_buf());
        Ok(())
    }

    async fn predict(
        &self,
        _dataset_id: u16,
        input_dir: &Path,
        output_dir: &Path,
        _fold: u8,
        _configuration: &str,
        _trainer_name: &str,
        _plan: &str,
        _workers: usize,
    ) -> Result<(), TrainerError> {
        self.bump();
        for key in image_case_keys(input_dir).unwrap() {
            Self::touch(&output_dir.join(format!("{key}.nii.gz")));
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        _ref_dir: &Path,
        pred_dir: &Path,
        _dataset_descriptor: &Path,
        _plans_descriptor: &Path,
        _workers: usize,
    ) -> Result<(), TrainerError> {
        self.bump();
        Self::touch(&pred_dir.join("summary.json"));
        Ok(())
    }
}

#[tokio::test]
async fn assembled_dataset_trains_and_resumes_without_rework() {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let labels = dir.path().join("labels");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&labels).unwrap();
    for i in 0..12 {
        write_volume(&images.join(format!("scan{i:02}.nii.gz")), &[100, 200]);
        write_volume(&labels.join(format!("scan{i:02}_seg.nii.gz")), &[101, 63]);
    }

    let root = dir.path().join("work");
    let config = PipelineConfig::new().with_work_dir(&root);
    let options = AssembleOptions::new(VariantSpec::step1(), &config);
    let assembled = assembler(&root)
        .assemble(&images, &labels, &options)
        .await
        .unwrap();
    assert_eq!(assembled.num_test, 1);

    let trainer = Arc::new(RecordingTrainer::new(&config, &assembled.dataset));
    let executor = StageExecutor::new(config, budget(), Arc::clone(&trainer) as _);

    let report = executor.run(&assembled.dataset).await.unwrap();
    assert_eq!(report.executed.len(), 7);
    // fingerprint, plan, preprocess, train, export, predict, evaluate
    assert_eq!(trainer.count(), 7);

    // Second run: every predicate holds, zero collaborator invocations.
    let report = executor.run(&assembled.dataset).await.unwrap();
    assert!(report.executed.is_empty());
    assert_eq!(report.skipped.len(), 7);
    assert_eq!(trainer.count(), 7);

    let layout = Layout::new(&root);
    let archive = layout.package_archive(
        &assembled.dataset,
        "nnUNetTrainer",
        "nnUNetPlans",
        "3d_fullres",
        0,
    );
    assert!(archive.is_file());
}
