//! Per-dataset stage manifest.
//!
//! Resumability is driven by an explicit record of what each stage produced,
//! persisted as `manifest.json` next to the outputs, rather than inferred
//! from file presence alone. A stage re-runs when its recorded outputs have
//! gone missing, which distinguishes a partially-written run from a
//! completed one.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The five external stages of one dataset's reduction, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FrameSet,
    Moment0,
    NoiseStats,
    ScienceNotebook,
    Visualization,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::FrameSet,
        Stage::Moment0,
        Stage::NoiseStats,
        Stage::ScienceNotebook,
        Stage::Visualization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FrameSet => "frame_set",
            Stage::Moment0 => "moment0",
            Stage::NoiseStats => "noise_stats",
            Stage::ScienceNotebook => "science_notebook",
            Stage::Visualization => "visualization",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Pending,
    Skipped { reason: String },
    Succeeded { outputs: Vec<PathBuf> },
    Failed { kind: String, detail: String },
}

impl StageOutcome {
    /// Whether this outcome means the stage's work is done and its products
    /// are still on disk.
    pub fn is_satisfied(&self) -> bool {
        match self {
            StageOutcome::Succeeded { outputs } => outputs.iter().all(|p| p.exists()),
            StageOutcome::Skipped { .. } => true,
            _ => false,
        }
    }
}

/// Stage → outcome map for one dataset, persisted alongside its outputs.
#[derive(Debug)]
pub struct StageManifest {
    path: PathBuf,
    entries: BTreeMap<String, StageOutcome>,
}

impl StageManifest {
    const FILE_NAME: &'static str = "manifest.json";

    /// Load the manifest from `dataset_dir`, or start an empty one. A
    /// corrupt manifest file is discarded: the worst case is re-running
    /// stages whose outputs are then found on disk.
    pub fn load_or_default(dataset_dir: &Path) -> Result<Self> {
        let path = dataset_dir.join(Self::FILE_NAME);
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Discarding corrupt manifest {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Ok(Self { path, entries })
    }

    /// Record an outcome and persist immediately, so an interrupted run
    /// leaves an accurate manifest behind.
    pub fn record(&mut self, stage: Stage, outcome: StageOutcome) -> Result<()> {
        self.entries.insert(stage.as_str().to_string(), outcome);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// The recorded outcome for a stage, if any.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.entries.get(stage.as_str())
    }

    /// Whether the stage is already complete with its products intact.
    pub fn is_satisfied(&self, stage: Stage) -> bool {
        self.outcome(stage).is_some_and(StageOutcome::is_satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_manifest_satisfies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = StageManifest::load_or_default(dir.path()).unwrap();
        for stage in Stage::ALL {
            assert!(!manifest.is_satisfied(stage));
        }
    }

    #[test]
    fn test_record_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = StageManifest::load_or_default(dir.path()).unwrap();
        manifest
            .record(Stage::FrameSet, StageOutcome::Succeeded { outputs: vec![] })
            .unwrap();

        let reloaded = StageManifest::load_or_default(dir.path()).unwrap();
        assert!(reloaded.is_satisfied(Stage::FrameSet));
        assert!(!reloaded.is_satisfied(Stage::Moment0));
    }

    #[test]
    fn test_missing_output_invalidates_success() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("mom0.fits");
        std::fs::write(&product, b"").unwrap();

        let mut manifest = StageManifest::load_or_default(dir.path()).unwrap();
        manifest
            .record(
                Stage::Moment0,
                StageOutcome::Succeeded {
                    outputs: vec![product.clone()],
                },
            )
            .unwrap();
        assert!(manifest.is_satisfied(Stage::Moment0));

        std::fs::remove_file(&product).unwrap();
        assert!(!manifest.is_satisfied(Stage::Moment0));
    }

    #[test]
    fn test_failed_outcome_is_not_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = StageManifest::load_or_default(dir.path()).unwrap();
        manifest
            .record(
                Stage::Moment0,
                StageOutcome::Failed {
                    kind: "nonzero-exit".into(),
                    detail: "collapse failed".into(),
                },
            )
            .unwrap();
        assert!(!manifest.is_satisfied(Stage::Moment0));
    }

    #[test]
    fn test_corrupt_manifest_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manifest.json"), b"{not json").unwrap();
        let manifest = StageManifest::load_or_default(dir.path()).unwrap();
        assert!(!manifest.is_satisfied(Stage::FrameSet));
    }
}
