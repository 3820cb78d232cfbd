//! Stage executor: idempotent, fail-fast stage driving per dataset.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Layout, PipelineConfig};
use crate::dataset::{image_case_keys, label_case_keys, Dataset};
use crate::package::{package_run, PackageError};
use crate::resources::ResourceBudget;
use crate::stages::{DatasetState, StageKind};
use crate::trainer::{SegmentationTrainer, TrainerError};

#[derive(Debug, Error)]
pub enum StageError {
    /// A collaborator invocation failed; the run aborts immediately.
    #[error("Stage '{stage}' failed for {dataset}: {source}")]
    Failed {
        stage: &'static str,
        dataset: String,
        #[source]
        source: TrainerError,
    },

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What one `run` call did for one dataset.
#[derive(Debug, Default)]
pub struct StageReport {
    pub executed: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
}

/// Drives every dataset through the stage sequence, strictly sequentially.
///
/// Datasets are processed one at a time and stages within a dataset are
/// strictly ordered; only the per-volume work inside a stage is parallel.
pub struct StageExecutor {
    layout: Layout,
    config: PipelineConfig,
    budget: ResourceBudget,
    trainer: Arc<dyn SegmentationTrainer>,
}

impl StageExecutor {
    pub fn new(
        config: PipelineConfig,
        budget: ResourceBudget,
        trainer: Arc<dyn SegmentationTrainer>,
    ) -> Self {
        Self {
            layout: config.layout(),
            config,
            budget,
            trainer,
        }
    }

    /// Runs all stages for `dataset`, skipping completed ones.
    pub async fn run(&self, dataset: &Dataset) -> Result<StageReport, StageError> {
        let mut report = StageReport::default();
        for stage in StageKind::ALL {
            if self.is_complete(dataset, stage)? {
                info!(dataset = %dataset, stage = %stage, "Stage already complete, skipping");
                report.skipped.push(stage.name());
                continue;
            }
            info!(dataset = %dataset, stage = %stage, "Running stage");
            self.execute(dataset, stage).await?;
            report.executed.push(stage.name());
        }
        Ok(report)
    }

    /// Runs each dataset in order; the first stage failure aborts the run.
    pub async fn run_all(&self, datasets: &[Dataset]) -> Result<Vec<StageReport>, StageError> {
        let mut reports = Vec::with_capacity(datasets.len());
        for dataset in datasets {
            reports.push(self.run(dataset).await?);
        }
        Ok(reports)
    }

    /// The furthest state whose stage prefix is entirely complete.
    pub fn current_state(&self, dataset: &Dataset) -> Result<DatasetState, StageError> {
        let mut state = DatasetState::NotStarted;
        for stage in StageKind::ALL {
            if !self.is_complete(dataset, stage)? {
                break;
            }
            state = stage.reached_state();
        }
        Ok(state)
    }

    fn is_complete(&self, dataset: &Dataset, stage: StageKind) -> Result<bool, StageError> {
        let config = &self.config;
        Ok(match stage {
            StageKind::Fingerprint => self.layout.fingerprint(dataset).is_file(),
            StageKind::Plan => self.layout.plan_file(dataset, &config.plan_name).is_file(),
            StageKind::Preprocess => {
                let dir = self.layout.preprocessed_config(
                    dataset,
                    &config.plan_name,
                    &config.configuration,
                );
                let labels = label_case_keys(&self.layout.labels_tr(dataset))?.len();
                labels > 0
                    && count_with_extension(&dir, "npz")? == labels
                    && count_with_extension(&dir, "pkl")? == labels
            }
            StageKind::Train => self
                .fold_dir(dataset)
                .join("checkpoint_final.pth")
                .is_file(),
            StageKind::Export => self.model_export(dataset).is_file(),
            StageKind::Evaluate => {
                // Nothing to evaluate without held-out cases.
                image_case_keys(&self.layout.images_ts(dataset))?.is_empty()
                    || self.predictions_dir(dataset).join("summary.json").is_file()
            }
            StageKind::Package => self
                .layout
                .package_archive(
                    dataset,
                    &config.trainer_name,
                    &config.plan_name,
                    &config.configuration,
                    config.fold,
                )
                .is_file(),
        })
    }

    async fn execute(&self, dataset: &Dataset, stage: StageKind) -> Result<(), StageError> {
        let config = &self.config;
        let fail = |source| StageError::Failed {
            stage: stage.name(),
            dataset: dataset.folder_name(),
            source,
        };
        match stage {
            StageKind::Fingerprint => self
                .trainer
                .extract_fingerprint(dataset.id, self.budget.jobs)
                .await
                .map_err(fail)?,
            StageKind::Plan => self
                .trainer
                .plan_experiment(dataset.id, &config.planner_name, &config.plan_name)
                .await
                .map_err(fail)?,
            StageKind::Preprocess => self
                .trainer
                .preprocess(
                    dataset.id,
                    &config.plan_name,
                    &config.configuration,
                    self.budget.jobs_for_training,
                )
                .await
                .map_err(fail)?,
            StageKind::Train => {
                let cached = self.decompressed_cache_ready(dataset)?;
                self.trainer
                    .train(
                        dataset.id,
                        &config.configuration,
                        config.fold,
                        &config.trainer_name,
                        &config.plan_name,
                        self.budget.device,
                        cached,
                    )
                    .await
                    .map_err(fail)?
            }
            StageKind::Export => {
                let out = self.model_export(dataset);
                if let Some(parent) = out.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                self.trainer
                    .export_model(
                        dataset.id,
                        &out,
                        &config.configuration,
                        config.fold,
                        &config.trainer_name,
                        &config.plan_name,
                    )
                    .await
                    .map_err(fail)?
            }
            StageKind::Evaluate => {
                let images_ts = self.layout.images_ts(dataset);
                if image_case_keys(&images_ts)?.is_empty() {
                    warn!(dataset = %dataset, "No held-out cases, skipping evaluation");
                    return Ok(());
                }
                let predictions = self.predictions_dir(dataset);
                std::fs::create_dir_all(&predictions)?;
                self.trainer
                    .predict(
                        dataset.id,
                        &images_ts,
                        &predictions,
                        config.fold,
                        &config.configuration,
                        &config.trainer_name,
                        &config.plan_name,
                        self.budget.jobs,
                    )
                    .await
                    .map_err(fail)?;
                self.trainer
                    .evaluate(
                        &self.layout.labels_ts(dataset),
                        &predictions,
                        &self.layout.descriptor(dataset),
                        &self.layout.plan_file(dataset, &config.plan_name),
                        self.budget.jobs,
                    )
                    .await
                    .map_err(fail)?
            }
            StageKind::Package => {
                package_run(&self.layout, config, dataset)?;
            }
        }
        Ok(())
    }

    /// Whether the preprocessed cache is fully decompressed.
    ///
    /// Each compressed `.npz` decompresses to two `.npy` arrays; a complete
    /// `.npy` set lets the trainer skip on-the-fly decompression. Purely an
    /// optimization decision, never a correctness one.
    fn decompressed_cache_ready(&self, dataset: &Dataset) -> Result<bool, StageError> {
        let dir = self.layout.preprocessed_config(
            dataset,
            &self.config.plan_name,
            &self.config.configuration,
        );
        let compressed = count_with_extension(&dir, "npz")?;
        Ok(compressed > 0 && count_with_extension(&dir, "npy")? == 2 * compressed)
    }

    fn fold_dir(&self, dataset: &Dataset) -> std::path::PathBuf {
        self.layout.fold_dir(
            dataset,
            &self.config.trainer_name,
            &self.config.plan_name,
            &self.config.configuration,
            self.config.fold,
        )
    }

    fn model_export(&self, dataset: &Dataset) -> std::path::PathBuf {
        self.layout.model_export(
            dataset,
            &self.config.trainer_name,
            &self.config.plan_name,
            &self.config.configuration,
            self.config.fold,
        )
    }

    fn predictions_dir(&self, dataset: &Dataset) -> std::path::PathBuf {
        self.layout.predictions_dir(
            dataset,
            &self.config.trainer_name,
            &self.config.plan_name,
            &self.config.configuration,
            self.config.fold,
        )
    }
}

fn count_with_extension(dir: &Path, extension: &str) -> Result<usize, std::io::Error> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e == extension).unwrap_or(false) {
            count += 1;
        }
    }
    Ok(count)
}
