//! Dataset configuration records.
//!
//! One JSON record per dataset under `configs/`. The `programID` doubles as
//! the output directory name under `data/`, and the input cube is named by a
//! glob pattern resolved against that directory.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration record for a single dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Unique dataset key; also the output directory name.
    #[serde(rename = "programID")]
    pub program_id: String,

    /// Glob pattern naming the input cube inside the dataset directory.
    pub fits_file: String,

    /// Forwarded to the analysis notebooks; opaque to the orchestrator.
    pub subblock_size: u32,

    /// Forwarded to the analysis notebooks; opaque to the orchestrator.
    pub noise_multiplier: f64,

    /// Spectral extent of the cube in its native axis units.
    pub frequency_range: [f64; 2],

    /// Velocity bounds for the moment-map collapses.
    pub velocity_range: [f64; 2],

    /// Velocity window for noise sampling.
    pub noise_range: [f64; 2],
}

impl DatasetConfig {
    /// Load a configuration record from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    /// Parse a configuration record from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DatasetConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the record. Ranges must be strictly ordered low < high so a
    /// degenerate collapse is rejected before any external call.
    pub fn validate(&self) -> Result<()> {
        if self.program_id.is_empty() {
            return Err(PipelineError::Config("programID must not be empty".into()));
        }
        if self.program_id.contains(['/', '\\']) {
            return Err(PipelineError::Config(format!(
                "programID `{}` must not contain path separators",
                self.program_id
            )));
        }
        if self.fits_file.is_empty() {
            return Err(PipelineError::Config("fits_file must not be empty".into()));
        }
        for (name, range) in [
            ("frequency_range", &self.frequency_range),
            ("velocity_range", &self.velocity_range),
            ("noise_range", &self.noise_range),
        ] {
            if !range[0].is_finite() || !range[1].is_finite() {
                return Err(PipelineError::Config(format!(
                    "{name} bounds must be finite, got [{}, {}]",
                    range[0], range[1]
                )));
            }
            if range[0] >= range[1] {
                return Err(PipelineError::Config(format!(
                    "{name} must be ordered low < high, got [{}, {}]",
                    range[0], range[1]
                )));
            }
        }
        Ok(())
    }

    /// The dataset's output directory under `data_dir`.
    pub fn dataset_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.program_id)
    }

    /// Resolve the input cube by expanding `fits_file` against the dataset
    /// directory. Exactly one match is required: zero matches and multiple
    /// matches are both errors, so the wrong cube is never picked silently.
    pub fn resolve_input(&self, dataset_dir: &Path) -> Result<PathBuf> {
        let pattern = dataset_dir.join(&self.fits_file);
        let pattern_str = pattern.to_string_lossy();

        let mut matches: Vec<PathBuf> = glob::glob(&pattern_str)
            .map_err(|e| PipelineError::Config(format!("bad glob `{}`: {}", self.fits_file, e)))?
            .filter_map(|entry| entry.ok())
            .collect();
        matches.sort();

        match matches.len() {
            0 => Err(PipelineError::NoMatch {
                pattern: self.fits_file.clone(),
                dir: dataset_dir.to_path_buf(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(PipelineError::AmbiguousMatch {
                pattern: self.fits_file.clone(),
                dir: dataset_dir.to_path_buf(),
                matches,
            }),
        }
    }

    /// A sample record, used by the `generate-config` subcommand.
    pub fn sample() -> Self {
        Self {
            program_id: "M09BC12_CO".into(),
            fits_file: "*reduced001*.fits".into(),
            subblock_size: 32,
            noise_multiplier: 3.0,
            frequency_range: [230.0, 231.0],
            velocity_range: [220.0, 320.0],
            noise_range: [-50.0, 50.0],
        }
    }
}
