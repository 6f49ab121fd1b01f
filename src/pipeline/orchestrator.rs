//! Per-dataset stage sequencing and the batch driver.
//!
//! One dataset moves through a fixed sequence of states; each external stage
//! is skipped when the manifest (or the artifacts already on disk) shows its
//! work is done. Failures are scoped to the dataset and the batch moves on,
//! with one exception: a toolkit environment that never initialized aborts
//! the whole run, since every later call would fail the same way.

use crate::config::DatasetConfig;
use crate::error::{PipelineError, Result};
use crate::notebook::{DocumentExecutor, ParamValue};
use crate::pipeline::manifest::{Stage, StageManifest, StageOutcome};
use crate::toolkit::{
    CollapseEstimator, NoiseStatsExtractor, SpectralStageRunner, StatsComponent, ToolkitRunner,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding dataset configuration records.
    pub config_dir: PathBuf,

    /// Root of the per-dataset data directories.
    pub data_dir: PathBuf,

    /// Glob pattern selecting configuration records inside `config_dir`.
    pub pattern: String,

    /// Science analysis notebook (Julia kernel).
    pub science_notebook: PathBuf,

    /// Visualization notebook (Python kernel).
    pub visual_notebook: PathBuf,

    pub science_kernel: String,
    pub visual_kernel: String,

    /// Wall-clock bound per toolkit command.
    pub toolkit_timeout_secs: u64,

    /// Wall-clock bound for the science notebook run.
    pub science_timeout_secs: u64,

    /// Wall-clock bound for the visualization notebook run.
    pub visual_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("configs"),
            data_dir: PathBuf::from("data"),
            pattern: "*.json".into(),
            science_notebook: PathBuf::from("LMC_range1_psi.ipynb"),
            visual_notebook: PathBuf::from("LMC_VGT_visual.ipynb"),
            science_kernel: "julia-1.11".into(),
            visual_kernel: "python3".into(),
            toolkit_timeout_secs: 600,
            science_timeout_secs: 6000,
            visual_timeout_secs: 300,
        }
    }
}

/// States one dataset moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetState {
    ConfigLoaded,
    InputResolved,
    FrameSet,
    Moment0Computed,
    NoiseExtracted,
    ScienceDocumentDone,
    VisualizationDone,
    Complete,
}

impl DatasetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigLoaded => "ConfigLoaded",
            Self::InputResolved => "InputResolved",
            Self::FrameSet => "FrameSet",
            Self::Moment0Computed => "Moment0Computed",
            Self::NoiseExtracted => "NoiseExtracted",
            Self::ScienceDocumentDone => "ScienceDocumentDone",
            Self::VisualizationDone => "VisualizationDone",
            Self::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result for one dataset.
#[derive(Debug, Clone)]
pub enum DatasetFinal {
    Complete,
    Failed {
        /// Last state the dataset reached before the failure.
        reached: DatasetState,
        kind: String,
        detail: String,
        /// Verbatim diagnostic text from the underlying tool, when distinct
        /// from `detail`.
        diagnostic: Option<String>,
    },
}

/// Outcome of one dataset's run.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub program_id: String,
    pub final_state: DatasetFinal,
    pub stages: Vec<(Stage, StageOutcome)>,
}

impl DatasetReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.final_state, DatasetFinal::Complete)
    }
}

impl std::fmt::Display for DatasetReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.final_state {
            DatasetFinal::Complete => write!(f, "{}: Complete", self.program_id),
            DatasetFinal::Failed {
                reached,
                kind,
                detail,
                diagnostic,
            } => {
                write!(f, "{}: Failed after {} ({}): {}", self.program_id, reached, kind, detail)?;
                if let Some(diag) = diagnostic {
                    if !detail.contains(diag.as_str()) {
                        write!(f, "\n    {}", diag.trim_end())?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Results of a whole batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub reports: Vec<DatasetReport>,
}

impl BatchSummary {
    pub fn completed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_complete()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.completed()
    }

    pub fn all_complete(&self) -> bool {
        self.failed() == 0
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} datasets: {} complete, {} failed",
            self.reports.len(),
            self.completed(),
            self.failed()
        )?;
        for report in &self.reports {
            writeln!(f, "  {}", report)?;
        }
        Ok(())
    }
}

/// Paths of the artifacts the toolkit stages produce for one dataset.
struct Artifacts {
    moment0: PathBuf,
    noisemap: PathBuf,
    kms_cube: PathBuf,
    kms_noisemap: PathBuf,
    noisemap_stats: PathBuf,
    kms_error_stats: PathBuf,
    kms_noisemap_stats: PathBuf,
}

impl Artifacts {
    fn new(dataset_dir: &Path) -> Self {
        Self {
            moment0: dataset_dir.join("mom0.fits"),
            noisemap: dataset_dir.join("noisemap.sdf"),
            kms_cube: dataset_dir.join("1kms.sdf"),
            kms_noisemap: dataset_dir.join("1kms_noisemap.sdf"),
            noisemap_stats: dataset_dir.join("noisemap_stats.json"),
            kms_error_stats: dataset_dir.join("1kms_error_stats.json"),
            kms_noisemap_stats: dataset_dir.join("1kms_noisemap_stats.json"),
        }
    }
}

/// Mutable progress of one dataset while its stages run.
struct DatasetRun {
    program_id: String,
    state: DatasetState,
    stages: Vec<(Stage, StageOutcome)>,
}

impl DatasetRun {
    fn new(config_path: &Path) -> Self {
        let program_id = config_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| config_path.display().to_string());
        Self {
            program_id,
            state: DatasetState::ConfigLoaded,
            stages: Vec::new(),
        }
    }

    fn push(&mut self, stage: Stage, outcome: StageOutcome) {
        self.stages.push((stage, outcome));
    }

    fn complete(mut self) -> DatasetReport {
        self.state = DatasetState::Complete;
        DatasetReport {
            program_id: self.program_id,
            final_state: DatasetFinal::Complete,
            stages: self.stages,
        }
    }

    fn failed(self, error: &PipelineError) -> DatasetReport {
        DatasetReport {
            program_id: self.program_id,
            final_state: DatasetFinal::Failed {
                reached: self.state,
                kind: error.kind().into(),
                detail: error.to_string(),
                diagnostic: error.diagnostic().map(str::to_string),
            },
            stages: self.stages,
        }
    }
}

/// Drives datasets through the stage sequence.
pub struct PipelineOrchestrator {
    spectral: SpectralStageRunner,
    stats: NoiseStatsExtractor,
    documents: Arc<dyn DocumentExecutor>,
    config: OrchestratorConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        toolkit: Arc<dyn ToolkitRunner>,
        documents: Arc<dyn DocumentExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        let toolkit_timeout = Duration::from_secs(config.toolkit_timeout_secs);
        Self {
            spectral: SpectralStageRunner::new(toolkit.clone(), toolkit_timeout),
            stats: NoiseStatsExtractor::new(toolkit, toolkit_timeout),
            documents,
            config,
        }
    }

    /// Process every configuration record matching the pattern, one dataset
    /// at a time. A failed dataset is recorded and the batch continues; a
    /// fatal error aborts immediately.
    pub async fn run_batch(&self) -> Result<BatchSummary> {
        let pattern = self.config.config_dir.join(&self.config.pattern);
        let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| PipelineError::Config(format!("bad config pattern: {e}")))?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        if paths.is_empty() {
            tracing::warn!("No configurations match {}", pattern.display());
        }

        let mut summary = BatchSummary::default();
        for path in paths {
            tracing::info!("===== Running pipeline for {} =====", path.display());
            let report = self.run_dataset(&path).await?;
            tracing::info!("===== {} =====", report);
            summary.reports.push(report);
        }
        Ok(summary)
    }

    /// Run one dataset. Dataset-scoped failures become a Failed report;
    /// only fatal errors propagate as `Err`.
    pub async fn run_dataset(&self, config_path: &Path) -> Result<DatasetReport> {
        let mut run = DatasetRun::new(config_path);
        match self.process(config_path, &mut run).await {
            Ok(()) => Ok(run.complete()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::error!("{}: failed after {}: {}", run.program_id, run.state, e);
                Ok(run.failed(&e))
            }
        }
    }

    async fn process(&self, config_path: &Path, run: &mut DatasetRun) -> Result<()> {
        let config = DatasetConfig::from_file(config_path)?;
        run.program_id.clone_from(&config.program_id);
        run.state = DatasetState::ConfigLoaded;

        let dataset_dir = config.dataset_dir(&self.config.data_dir);
        let cube = config.resolve_input(&dataset_dir)?;
        run.state = DatasetState::InputResolved;
        tracing::info!("{}: input cube {}", config.program_id, cube.display());

        let mut manifest = StageManifest::load_or_default(&dataset_dir)?;
        let artifacts = Artifacts::new(&dataset_dir);

        // Frame configuration: metadata-only, so the manifest is the only
        // completion record.
        self.run_stage(run, &mut manifest, Stage::FrameSet, &[], async {
            self.spectral.set_velocity_frame(&cube).await?;
            Ok(Vec::new())
        })
        .await?;
        run.state = DatasetState::FrameSet;

        let map_outputs = [artifacts.moment0.clone(), artifacts.noisemap.clone()];
        self.run_stage(run, &mut manifest, Stage::Moment0, &map_outputs, async {
            self.spectral
                .make_maps(&cube, config.velocity_range, &artifacts.moment0, &artifacts.noisemap)
                .await?;
            Ok(map_outputs.to_vec())
        })
        .await?;
        run.state = DatasetState::Moment0Computed;

        let stats_outputs = [
            artifacts.noisemap_stats.clone(),
            artifacts.kms_error_stats.clone(),
            artifacts.kms_noisemap_stats.clone(),
        ];
        self.run_stage(run, &mut manifest, Stage::NoiseStats, &stats_outputs, async {
            self.spectral.resample_1kms(&cube, &artifacts.kms_cube).await?;
            self.spectral
                .collapse(
                    &artifacts.kms_cube,
                    config.noise_range,
                    CollapseEstimator::Dispersion,
                    &artifacts.kms_noisemap,
                )
                .await?;

            let record = self
                .stats
                .extract(&artifacts.noisemap, None, StatsComponent::Data)
                .await?;
            record.save(&artifacts.noisemap_stats)?;

            let record = self
                .stats
                .extract(&artifacts.kms_cube, Some(config.noise_range), StatsComponent::Error)
                .await?;
            record.save(&artifacts.kms_error_stats)?;

            let record = self
                .stats
                .extract(&artifacts.kms_noisemap, None, StatsComponent::Data)
                .await?;
            record.save(&artifacts.kms_noisemap_stats)?;

            Ok(stats_outputs.to_vec())
        })
        .await?;
        run.state = DatasetState::NoiseExtracted;

        // The notebooks' own products are opaque to the orchestrator, so
        // their completion record is the manifest alone.
        let science_params = vec![
            (
                "config_path".to_string(),
                ParamValue::Str(config_path.display().to_string()),
            ),
            (
                "noise_path".to_string(),
                ParamValue::Str(artifacts.noisemap_stats.display().to_string()),
            ),
        ];
        let science_timeout = Duration::from_secs(self.config.science_timeout_secs);
        self.run_stage(run, &mut manifest, Stage::ScienceNotebook, &[], async {
            self.documents
                .execute(
                    &self.config.science_notebook,
                    &self.config.science_kernel,
                    &science_params,
                    science_timeout,
                )
                .await?;
            Ok(Vec::new())
        })
        .await?;
        run.state = DatasetState::ScienceDocumentDone;

        let visual_params = vec![(
            "config_path".to_string(),
            ParamValue::Str(config_path.display().to_string()),
        )];
        let visual_timeout = Duration::from_secs(self.config.visual_timeout_secs);
        self.run_stage(run, &mut manifest, Stage::Visualization, &[], async {
            self.documents
                .execute(
                    &self.config.visual_notebook,
                    &self.config.visual_kernel,
                    &visual_params,
                    visual_timeout,
                )
                .await?;
            Ok(Vec::new())
        })
        .await?;
        run.state = DatasetState::VisualizationDone;

        Ok(())
    }

    /// Common stage wrapper: skip when already satisfied, otherwise run the
    /// work and record the outcome in the manifest either way.
    async fn run_stage<F>(
        &self,
        run: &mut DatasetRun,
        manifest: &mut StageManifest,
        stage: Stage,
        declared_outputs: &[PathBuf],
        work: F,
    ) -> Result<()>
    where
        F: Future<Output = Result<Vec<PathBuf>>>,
    {
        if let Some(reason) = skip_reason(manifest, stage, declared_outputs) {
            tracing::info!("{}: {} skipped ({})", run.program_id, stage, reason);
            let outcome = StageOutcome::Skipped { reason };
            if manifest.outcome(stage).is_none() {
                manifest.record(stage, outcome.clone())?;
            }
            run.push(stage, outcome);
            return Ok(());
        }

        tracing::info!("{}: running {}", run.program_id, stage);
        match work.await {
            Ok(outputs) => {
                let outcome = StageOutcome::Succeeded { outputs };
                manifest.record(stage, outcome.clone())?;
                run.push(stage, outcome);
                Ok(())
            }
            Err(e) => {
                let outcome = StageOutcome::Failed {
                    kind: e.kind().into(),
                    detail: e.to_string(),
                };
                // Best effort: the error being recorded outranks a manifest
                // write failure.
                if let Err(manifest_err) = manifest.record(stage, outcome.clone()) {
                    tracing::warn!("Could not record failed {} in manifest: {}", stage, manifest_err);
                }
                run.push(stage, outcome);
                Err(e)
            }
        }
    }
}

/// A stage is skipped when the manifest shows it satisfied, or when its
/// declared outputs are all present from a run that predates the manifest.
fn skip_reason(manifest: &StageManifest, stage: Stage, declared: &[PathBuf]) -> Option<String> {
    if manifest.is_satisfied(stage) {
        return Some("recorded in manifest".into());
    }
    if !declared.is_empty() && declared.iter().all(|p| p.exists()) {
        return Some("outputs already present".into());
    }
    None
}
