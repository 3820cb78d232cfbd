//! Image-transform and augmentation collaborators.
//!
//! Geometric normalization (4-D collapse, canonical reorientation, isotropic
//! resampling, label-to-image alignment) and synthetic augmentation are
//! external tools; this crate only defines their interfaces and the
//! process-backed default implementations. All operations are
//! file-tree-to-file-tree and parallel over the budgeted worker count.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::process::{path_arg, run_command, ProcessError};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Geometric normalization suite.
#[async_trait]
pub trait ImageTransforms: Send + Sync {
    /// Collapses 4-D acquisitions to 3-D by averaging the fourth axis.
    async fn average_4d_to_3d(
        &self,
        source: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError>;

    /// Reorients every volume to canonical (closest to RAS) orientation.
    async fn reorient_canonical(
        &self,
        source: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError>;

    /// Resamples every volume to isotropic spacing.
    async fn resample_isotropic(
        &self,
        source: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError>;

    /// Resamples labels onto the geometry of their matching images.
    async fn align_label_to_image(
        &self,
        images: &Path,
        labels: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError>;
}

/// Synthetic augmentation collaborator.
#[async_trait]
pub trait Augmenter: Send + Sync {
    /// Produces additional synthetic cases next to the existing ones.
    ///
    /// `preserve_classes` are label values the augmentation must not distort.
    async fn augment(
        &self,
        images: &Path,
        labels: &Path,
        preserve_classes: &[i32],
        workers: usize,
    ) -> Result<(), TransformError>;
}

/// Process-backed transforms using the `totalspineseg_*` CLI suite.
pub struct ProcessTransforms;

impl ProcessTransforms {
    fn tree_args(source: &Path, dest: &Path, recursive: bool, workers: usize) -> Vec<String> {
        let mut args = vec![
            path_arg(source),
            "-o".to_string(),
            path_arg(dest),
            "-w".to_string(),
            workers.to_string(),
        ];
        if recursive {
            args.push("-r".to_string());
        }
        args
    }
}

#[async_trait]
impl ImageTransforms for ProcessTransforms {
    async fn average_4d_to_3d(
        &self,
        source: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError> {
        run_command(
            "totalspineseg_average4d",
            &Self::tree_args(source, dest, recursive, workers),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn reorient_canonical(
        &self,
        source: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError> {
        run_command(
            "totalspineseg_reorient_canonical",
            &Self::tree_args(source, dest, recursive, workers),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn resample_isotropic(
        &self,
        source: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError> {
        run_command(
            "totalspineseg_resample",
            &Self::tree_args(source, dest, recursive, workers),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn align_label_to_image(
        &self,
        images: &Path,
        labels: &Path,
        dest: &Path,
        recursive: bool,
        workers: usize,
    ) -> Result<(), TransformError> {
        let mut args = vec![
            "-i".to_string(),
            path_arg(images),
            "-s".to_string(),
            path_arg(labels),
            "-o".to_string(),
            path_arg(dest),
            "-w".to_string(),
            workers.to_string(),
        ];
        if recursive {
            args.push("-r".to_string());
        }
        run_command("totalspineseg_transform_seg2image", &args, &[]).await?;
        Ok(())
    }
}

/// Process-backed augmentation using the `totalspineseg_augment` tool.
pub struct ProcessAugmenter;

#[async_trait]
impl Augmenter for ProcessAugmenter {
    async fn augment(
        &self,
        images: &Path,
        labels: &Path,
        preserve_classes: &[i32],
        workers: usize,
    ) -> Result<(), TransformError> {
        let preserve: Vec<String> = preserve_classes.iter().map(|c| c.to_string()).collect();
        let mut args = vec![
            "-i".to_string(),
            path_arg(images),
            "-s".to_string(),
            path_arg(labels),
            "-o".to_string(),
            path_arg(images),
            "-g".to_string(),
            path_arg(labels),
            "-w".to_string(),
            workers.to_string(),
        ];
        if !preserve.is_empty() {
            args.push("--labels2keep".to_string());
            args.extend(preserve);
        }
        run_command("totalspineseg_augment", &args, &[]).await?;
        Ok(())
    }
}

/// Transforms that do nothing; volumes are assumed already normalized.
///
/// Used when the collaborator suite is unavailable and in tests.
pub struct NoopTransforms;

#[async_trait]
impl ImageTransforms for NoopTransforms {
    async fn average_4d_to_3d(
        &self,
        _source: &Path,
        _dest: &Path,
        _recursive: bool,
        _workers: usize,
    ) -> Result<(), TransformError> {
        Ok(())
    }

    async fn reorient_canonical(
        &self,
        _source: &Path,
        _dest: &Path,
        _recursive: bool,
        _workers: usize,
    ) -> Result<(), TransformError> {
        Ok(())
    }

    async fn resample_isotropic(
        &self,
        _source: &Path,
        _dest: &Path,
        _recursive: bool,
        _workers: usize,
    ) -> Result<(), TransformError> {
        Ok(())
    }

    async fn align_label_to_image(
        &self,
        _images: &Path,
        _labels: &Path,
        _dest: &Path,
        _recursive: bool,
        _workers: usize,
    ) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Augmenter that produces nothing.
pub struct NoopAugmenter;

#[async_trait]
impl Augmenter for NoopAugmenter {
    async fn augment(
        &self,
        _images: &Path,
        _labels: &Path,
        _preserve_classes: &[i32],
        _workers: usize,
    ) -> Result<(), TransformError> {
        Ok(())
    }
}
