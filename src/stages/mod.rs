//! The training stage sequence and its executor.
//!
//! Each dataset advances through a fixed stage order, every stage guarded by
//! an on-disk completion predicate. Re-invoking a run skips everything whose
//! artifacts already exist.

pub mod executor;

pub use executor::{StageError, StageExecutor, StageReport};

/// The ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Fingerprint,
    Plan,
    Preprocess,
    Train,
    Export,
    Evaluate,
    Package,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Fingerprint,
        StageKind::Plan,
        StageKind::Preprocess,
        StageKind::Train,
        StageKind::Export,
        StageKind::Evaluate,
        StageKind::Package,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Fingerprint => "fingerprint",
            StageKind::Plan => "plan",
            StageKind::Preprocess => "preprocess",
            StageKind::Train => "train",
            StageKind::Export => "export",
            StageKind::Evaluate => "evaluate",
            StageKind::Package => "package",
        }
    }

    /// The state a dataset reaches once this stage completes.
    pub fn reached_state(&self) -> DatasetState {
        match self {
            StageKind::Fingerprint => DatasetState::FingerprintExtracted,
            StageKind::Plan => DatasetState::Planned,
            StageKind::Preprocess => DatasetState::Preprocessed,
            StageKind::Train => DatasetState::Trained,
            StageKind::Export => DatasetState::Exported,
            StageKind::Evaluate => DatasetState::Evaluated,
            StageKind::Package => DatasetState::Packaged,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-dataset progress through the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatasetState {
    NotStarted,
    FingerprintExtracted,
    Planned,
    Preprocessed,
    Trained,
    Exported,
    Evaluated,
    Packaged,
}
