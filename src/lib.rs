//! spineforge: spine segmentation training pipeline orchestrator.
//!
//! This library assembles trainer-ready spine segmentation datasets from raw
//! image/label collections and drives an nnU-Net-style trainer through an
//! idempotent stage sequence.

// Core modules
pub mod batch;
pub mod channels;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod nifti;
pub mod package;
pub mod process;
pub mod remap;
pub mod resources;
pub mod stages;
pub mod trainer;
pub mod transforms;

// Re-export commonly used types
pub use config::{ConfigError, Layout, PipelineConfig, VariantSpec};
pub use dataset::{AssembleError, AssembleOptions, AssembledDataset, Assembler, Dataset};
pub use remap::{LabelMap, RemapError, UnmappedPolicy};
pub use resources::{compute_budget, Device, ResourceBudget};
pub use stages::{StageError, StageExecutor, StageKind};
pub use trainer::{NnUnetTrainer, SegmentationTrainer, TrainerError};
