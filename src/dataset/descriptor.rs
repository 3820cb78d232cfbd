//! Dataset descriptor emission.
//!
//! The descriptor records the training-case count, the class vocabulary and
//! `regions_class_order` for the trainer. Class ids are contiguous integers
//! starting at 1; `regions_class_order` controls the printed order of
//! per-class metrics, not the numeric ids themselves.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Class ids must be contiguous starting at 1, got {0:?}")]
    NonContiguousClasses(Vec<i32>),
}

/// Dataset descriptor consumed by the stage executor and the trainer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetDescriptor {
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    pub labels: BTreeMap<String, i32>,
    pub regions_class_order: Vec<i32>,
}

impl DatasetDescriptor {
    /// Builds a descriptor from named classes, validating contiguity.
    ///
    /// `classes` excludes background; `background: 0` is added implicitly.
    pub fn new(
        num_training: usize,
        classes: &[(&str, i32)],
    ) -> Result<Self, DescriptorError> {
        let mut ids: Vec<i32> = classes.iter().map(|(_, id)| *id).collect();
        ids.sort_unstable();
        let contiguous = ids.iter().enumerate().all(|(i, &id)| id == i as i32 + 1);
        if !contiguous {
            return Err(DescriptorError::NonContiguousClasses(ids));
        }

        let mut labels = BTreeMap::new();
        labels.insert("background".to_string(), 0);
        for (name, id) in classes {
            labels.insert((*name).to_string(), *id);
        }
        Ok(Self {
            num_training,
            labels,
            regions_class_order: ids,
        })
    }

    /// Moves `class_id` to the front of the printed metric order.
    pub fn with_class_first(mut self, class_id: i32) -> Self {
        if let Some(pos) = self.regions_class_order.iter().position(|&c| c == class_id) {
            self.regions_class_order.remove(pos);
            self.regions_class_order.insert(0, class_id);
        }
        self
    }

    pub fn save(&self, path: &Path) -> Result<(), DescriptorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step1_classes() -> Vec<(&'static str, i32)> {
        vec![
            ("LDH", 1),
            ("spinal_cord", 2),
            ("spinal_canal", 3),
            ("vertebrae_odd", 4),
            ("vertebrae_even", 5),
            ("disc_odd", 6),
            ("disc_even", 7),
            ("sacrum", 8),
        ]
    }

    #[test]
    fn builds_contiguous_descriptor() {
        let d = DatasetDescriptor::new(42, &step1_classes()).unwrap();
        assert_eq!(d.num_training, 42);
        assert_eq!(d.labels["background"], 0);
        assert_eq!(d.labels["LDH"], 1);
        assert_eq!(d.regions_class_order, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn rejects_gaps_in_class_ids() {
        let err = DatasetDescriptor::new(1, &[("a", 1), ("b", 3)]).unwrap_err();
        assert!(matches!(err, DescriptorError::NonContiguousClasses(_)));
    }

    #[test]
    fn class_first_reorders_metrics_not_ids() {
        let d = DatasetDescriptor::new(5, &step1_classes())
            .unwrap()
            .with_class_first(1);
        assert_eq!(d.regions_class_order[0], 1);
        assert_eq!(d.regions_class_order.len(), 8);
        // id unchanged
        assert_eq!(d.labels["LDH"], 1);

        let d = DatasetDescriptor::new(5, &step1_classes())
            .unwrap()
            .with_class_first(8);
        assert_eq!(d.regions_class_order, vec![8, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn json_roundtrip_uses_wire_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        let d = DatasetDescriptor::new(7, &step1_classes()).unwrap();
        d.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"numTraining\": 7"));
        assert!(raw.contains("regions_class_order"));

        let loaded = DatasetDescriptor::load(&path).unwrap();
        assert_eq!(loaded, d);
    }
}
