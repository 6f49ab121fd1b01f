//! Cube reduction pipeline.
//!
//! Batch orchestration for spectral line cube reduction: for each dataset
//! named by a configuration record, the pipeline fixes the cube's velocity
//! frame, collapses it into moment-0 and RMS maps, extracts noise statistics
//! into JSON, and runs the science and visualization notebooks — all through
//! external tools, with per-stage resumability and per-dataset failure
//! isolation.
//!
//! # Architecture
//!
//! - **Config**: dataset records with strict range validation and
//!   exact-single-match input resolution
//! - **Toolkit**: the initialized-environment handle and the spectral /
//!   statistics stage runners built on it
//! - **Notebook**: parameterized headless notebook execution
//! - **Pipeline**: the per-dataset state machine, stage manifest, and batch
//!   driver
//!
//! # Usage
//!
//! ```no_run
//! use cube_reduce::{run_batch, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let summary = run_batch(None, OrchestratorConfig::default()).await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod notebook;
pub mod pipeline;
pub mod toolkit;

pub use config::DatasetConfig;
pub use error::{PipelineError, Result};
pub use notebook::{DocumentExecutor, JupyterExecutor, ParamValue};
pub use pipeline::{
    BatchSummary, DatasetReport, DatasetState, OrchestratorConfig, PipelineOrchestrator, Stage,
    StageOutcome,
};
pub use toolkit::{ToolkitEnv, ToolkitRunner};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Initialize the toolkit environment and run the full batch.
///
/// `toolkit_dir` falls back to `$STARLINK_DIR`; without either, the run is
/// refused up front with the same fatal error an unloadable toolchain would
/// produce.
pub async fn run_batch(
    toolkit_dir: Option<PathBuf>,
    config: OrchestratorConfig,
) -> Result<BatchSummary> {
    let toolkit_dir = toolkit_dir
        .or_else(|| std::env::var_os("STARLINK_DIR").map(PathBuf::from))
        .ok_or_else(|| PipelineError::ToolchainNotInitialized {
            detail: "STARLINK_DIR is not set and --starlink-dir was not given".into(),
        })?;

    let timeout = Duration::from_secs(config.toolkit_timeout_secs);
    let toolkit = ToolkitEnv::initialize(&toolkit_dir, timeout).await?;

    let orchestrator = PipelineOrchestrator::new(
        Arc::new(toolkit),
        Arc::new(JupyterExecutor::new()),
        config,
    );
    orchestrator.run_batch().await
}

/// Build the Tokio runtime the pipeline runs on.
pub fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build()
}
