//! Case-key extraction strategies and the persistent key manifest.
//!
//! Identity policy is decoupled from the assembler: a [`KeyExtractor`]
//! derives a sanitized case key from a raw filename, with the digit-pattern
//! strategy first and a content-hash fallback for names carrying no digits.
//! Assignments are recorded in a manifest so repeated runs reuse prior keys,
//! and collisions get a counter suffix.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::nifti::volume_stem;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Cannot derive a case key for '{0}'")]
    NoKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Derives a sanitized case key from a raw file.
pub trait KeyExtractor: Send + Sync {
    /// Returns a key candidate, or `None` when this strategy does not apply.
    fn extract(&self, path: &Path) -> Result<Option<String>, KeyError>;

    fn name(&self) -> &'static str;
}

/// Digit-pattern extraction: all digit runs in the stem, joined with `_`.
///
/// `Case10.nii.gz` and `mask_case10.nii.gz` both yield `case_10`, which is
/// what pairs images with their masks.
pub struct DigitPattern {
    pattern: Regex,
}

impl Default for DigitPattern {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"\d+").expect("static pattern"),
        }
    }
}

impl KeyExtractor for DigitPattern {
    fn extract(&self, path: &Path) -> Result<Option<String>, KeyError> {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let stem = volume_stem(&name).unwrap_or(&name);
        let runs: Vec<&str> = self.pattern.find_iter(stem).map(|m| m.as_str()).collect();
        if runs.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("case_{}", runs.join("_"))))
    }

    fn name(&self) -> &'static str {
        "digit-pattern"
    }
}

/// Content-hash fallback: first 10 hex chars of the file's SHA-256.
pub struct ContentHash;

impl KeyExtractor for ContentHash {
    fn extract(&self, path: &Path) -> Result<Option<String>, KeyError> {
        let bytes = std::fs::read(path)?;
        let digest = Sha256::digest(&bytes);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok(Some(format!("case_{}", &hex[..10])))
    }

    fn name(&self) -> &'static str {
        "content-hash"
    }
}

/// Ordered chain of strategies; the first that applies wins.
pub struct ExtractorChain {
    strategies: Vec<Box<dyn KeyExtractor>>,
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(DigitPattern::default()), Box::new(ContentHash)],
        }
    }
}

impl ExtractorChain {
    pub fn new(strategies: Vec<Box<dyn KeyExtractor>>) -> Self {
        Self { strategies }
    }

    pub fn extract(&self, path: &Path) -> Result<String, KeyError> {
        for strategy in &self.strategies {
            if let Some(key) = strategy.extract(path)? {
                debug!(strategy = strategy.name(), key = %key, file = %path.display(), "Derived case key");
                return Ok(key);
            }
        }
        Err(KeyError::NoKey(path.display().to_string()))
    }
}

/// Persistent `original name -> sanitized key` manifest.
///
/// Repeated runs reuse prior assignments; a new original colliding with an
/// already-used key gets a `_2`, `_3`, ... suffix.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyManifest {
    assignments: BTreeMap<String, String>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl KeyManifest {
    /// Loads the manifest at `path`, or starts empty when absent.
    pub fn load_or_default(path: &Path) -> Result<Self, KeyError> {
        let mut manifest = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        manifest.path = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// Assigns (or recalls) a unique key for `original`.
    pub fn assign(&mut self, original: &str, candidate: &str) -> String {
        if let Some(existing) = self.assignments.get(original) {
            return existing.clone();
        }
        let used: BTreeSet<&String> = self.assignments.values().collect();
        let mut key = candidate.to_string();
        let mut counter = 2;
        while used.contains(&key) {
            key = format!("{candidate}_{counter}");
            counter += 1;
        }
        self.assignments.insert(original.to_string(), key.clone());
        key
    }

    /// Writes the manifest back to its load path.
    pub fn save(&self) -> Result<(), KeyError> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_pattern_pairs_images_with_masks() {
        let extractor = DigitPattern::default();
        let a = extractor.extract(Path::new("Case10.nii.gz")).unwrap();
        let b = extractor.extract(Path::new("mask_case10.nii.gz")).unwrap();
        assert_eq!(a.as_deref(), Some("case_10"));
        assert_eq!(a, b);
    }

    #[test]
    fn digit_pattern_joins_multiple_runs() {
        let extractor = DigitPattern::default();
        let key = extractor
            .extract(Path::new("100_patient 20130610.nii.gz"))
            .unwrap();
        assert_eq!(key.as_deref(), Some("case_100_20130610"));
    }

    #[test]
    fn digit_pattern_declines_digitless_names() {
        let extractor = DigitPattern::default();
        assert_eq!(extractor.extract(Path::new("spine.nii.gz")).unwrap(), None);
    }

    #[test]
    fn content_hash_fallback_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spine.nii.gz");
        std::fs::write(&path, b"payload").unwrap();

        let chain = ExtractorChain::default();
        let first = chain.extract(&path).unwrap();
        let second = chain.extract(&path).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("case_"));
        assert_eq!(first.len(), "case_".len() + 10);
    }

    #[test]
    fn manifest_reuses_and_uniquifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = KeyManifest::load_or_default(&path).unwrap();

        assert_eq!(manifest.assign("Case10.nii.gz", "case_10"), "case_10");
        // Same original again: reused, not uniquified.
        assert_eq!(manifest.assign("Case10.nii.gz", "case_10"), "case_10");
        // Different original colliding on the key: counter suffix.
        assert_eq!(manifest.assign("other10.nii.gz", "case_10"), "case_10_2");
        assert_eq!(manifest.assign("third10.nii.gz", "case_10"), "case_10_3");
        manifest.save().unwrap();

        let reloaded = KeyManifest::load_or_default(&path).unwrap();
        let mut reloaded = reloaded;
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.assign("Case10.nii.gz", "case_10"), "case_10");
    }
}
