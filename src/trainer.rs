//! Segmentation trainer collaborator.
//!
//! Fingerprinting, experiment planning, preprocessing, training, export,
//! inference and metric computation all live in an external nnU-Net-style
//! tool suite. This module defines the interface the stage executor drives
//! and the process-backed default implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::process::{path_arg, run_command, ProcessError};
use crate::resources::Device;

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// The external trainer/predictor/evaluator, specified at its interface.
#[async_trait]
pub trait SegmentationTrainer: Send + Sync {
    async fn extract_fingerprint(&self, dataset_id: u16, workers: usize)
        -> Result<(), TrainerError>;

    async fn plan_experiment(
        &self,
        dataset_id: u16,
        planner: &str,
        plan: &str,
    ) -> Result<(), TrainerError>;

    async fn preprocess(
        &self,
        dataset_id: u16,
        plan: &str,
        configuration: &str,
        workers: usize,
    ) -> Result<(), TrainerError>;

    #[allow(clippy::too_many_arguments)]
    async fn train(
        &self,
        dataset_id: u16,
        configuration: &str,
        fold: u8,
        trainer_name: &str,
        plan: &str,
        device: Device,
        use_cached_decompressed: bool,
    ) -> Result<(), TrainerError>;

    async fn export_model(
        &self,
        dataset_id: u16,
        out_path: &Path,
        configuration: &str,
        fold: u8,
        trainer_name: &str,
        plan: &str,
    ) -> Result<(), TrainerError>;

    #[allow(clippy::too_many_arguments)]
    async fn predict(
        &self,
        dataset_id: u16,
        input_dir: &Path,
        output_dir: &Path,
        fold: u8,
        configuration: &str,
        trainer_name: &str,
        plan: &str,
        workers: usize,
    ) -> Result<(), TrainerError>;

    async fn evaluate(
        &self,
        ref_dir: &Path,
        pred_dir: &Path,
        dataset_descriptor: &Path,
        plans_descriptor: &Path,
        workers: usize,
    ) -> Result<(), TrainerError>;
}

/// Process-backed trainer driving the `nnUNetv2_*` command suite.
///
/// The nnU-Net environment directories are passed explicitly on every
/// invocation, so no process-wide state leaks between runs.
pub struct NnUnetTrainer {
    raw_dir: PathBuf,
    preprocessed_dir: PathBuf,
    results_dir: PathBuf,
}

impl NnUnetTrainer {
    pub fn new(raw_dir: PathBuf, preprocessed_dir: PathBuf, results_dir: PathBuf) -> Self {
        Self {
            raw_dir,
            preprocessed_dir,
            results_dir,
        }
    }

    fn envs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("nnUNet_raw", path_arg(&self.raw_dir)),
            ("nnUNet_preprocessed", path_arg(&self.preprocessed_dir)),
            ("nnUNet_results", path_arg(&self.results_dir)),
        ]
    }
}

#[async_trait]
impl SegmentationTrainer for NnUnetTrainer {
    async fn extract_fingerprint(
        &self,
        dataset_id: u16,
        workers: usize,
    ) -> Result<(), TrainerError> {
        let args = vec![
            "-d".to_string(),
            dataset_id.to_string(),
            "-np".to_string(),
            workers.to_string(),
        ];
        run_command("nnUNetv2_extract_fingerprint", &args, &self.envs()).await?;
        Ok(())
    }

    async fn plan_experiment(
        &self,
        dataset_id: u16,
        planner: &str,
        plan: &str,
    ) -> Result<(), TrainerError> {
        let args = vec![
            "-d".to_string(),
            dataset_id.to_string(),
            "-pl".to_string(),
            planner.to_string(),
            "-overwrite_plans_name".to_string(),
            plan.to_string(),
        ];
        run_command("nnUNetv2_plan_experiment", &args, &self.envs()).await?;
        Ok(())
    }

    async fn preprocess(
        &self,
        dataset_id: u16,
        plan: &str,
        configuration: &str,
        workers: usize,
    ) -> Result<(), TrainerError> {
        let args = vec![
            "-d".to_string(),
            dataset_id.to_string(),
            "-plans_name".to_string(),
            plan.to_string(),
            "-c".to_string(),
            configuration.to_string(),
            "-np".to_string(),
            workers.to_string(),
        ];
        run_command("nnUNetv2_preprocess", &args, &self.envs()).await?;
        Ok(())
    }

    async fn train(
        &self,
        dataset_id: u16,
        configuration: &str,
        fold: u8,
        trainer_name: &str,
        plan: &str,
        device: Device,
        use_cached_decompressed: bool,
    ) -> Result<(), TrainerError> {
        let mut args = vec![
            dataset_id.to_string(),
            configuration.to_string(),
            fold.to_string(),
            "-tr".to_string(),
            trainer_name.to_string(),
            "-p".to_string(),
            plan.to_string(),
            "-device".to_string(),
            match device {
                Device::Gpu => "cuda".to_string(),
                Device::Cpu => "cpu".to_string(),
            },
        ];
        // With a complete .npy cache the trainer reads it directly;
        // otherwise it decompresses .npz on the fly.
        if !use_cached_decompressed {
            args.push("--use_compressed".to_string());
        }
        run_command("nnUNetv2_train", &args, &self.envs()).await?;
        Ok(())
    }

    async fn export_model(
        &self,
        dataset_id: u16,
        out_path: &Path,
        configuration: &str,
        fold: u8,
        trainer_name: &str,
        plan: &str,
    ) -> Result<(), TrainerError> {
        let args = vec![
            "-d".to_string(),
            dataset_id.to_string(),
            "-o".to_string(),
            path_arg(out_path),
            "-c".to_string(),
            configuration.to_string(),
            "-f".to_string(),
            fold.to_string(),
            "-tr".to_string(),
            trainer_name.to_string(),
            "-p".to_string(),
            plan.to_string(),
        ];
        run_command("nnUNetv2_export_model_to_zip", &args, &self.envs()).await?;
        Ok(())
    }

    async fn predict(
        &self,
        dataset_id: u16,
        input_dir: &Path,
        output_dir: &Path,
        fold: u8,
        configuration: &str,
        trainer_name: &str,
        plan: &str,
        workers: usize,
    ) -> Result<(), TrainerError> {
        let args = vec![
            "-d".to_string(),
            dataset_id.to_string(),
            "-i".to_string(),
            path_arg(input_dir),
            "-o".to_string(),
            path_arg(output_dir),
            "-f".to_string(),
            fold.to_string(),
            "-c".to_string(),
            configuration.to_string(),
            "-tr".to_string(),
            trainer_name.to_string(),
            "-p".to_string(),
            plan.to_string(),
            "-npp".to_string(),
            workers.to_string(),
            "-nps".to_string(),
            workers.to_string(),
        ];
        run_command("nnUNetv2_predict", &args, &self.envs()).await?;
        Ok(())
    }

    async fn evaluate(
        &self,
        ref_dir: &Path,
        pred_dir: &Path,
        dataset_descriptor: &Path,
        plans_descriptor: &Path,
        workers: usize,
    ) -> Result<(), TrainerError> {
        let args = vec![
            path_arg(ref_dir),
            path_arg(pred_dir),
            "-djfile".to_string(),
            path_arg(dataset_descriptor),
            "-pfile".to_string(),
            path_arg(plans_descriptor),
            "-np".to_string(),
            workers.to_string(),
        ];
        run_command("nnUNetv2_evaluate_folder", &args, &self.envs()).await?;
        Ok(())
    }
}
