//! Error taxonomy for the reduction pipeline.
//!
//! Every failure mode an external collaborator can produce has its own
//! variant, so the orchestrator can match on kind when deciding whether a
//! failure is scoped to one dataset or aborts the whole batch.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or malformed configuration field, or a non-ordered range.
    #[error("configuration error: {0}")]
    Config(String),

    /// The input glob matched no file in the dataset directory.
    #[error("no input matching `{pattern}` in {}", dir.display())]
    NoMatch { pattern: String, dir: PathBuf },

    /// The input glob matched more than one file. An exact single match is
    /// required so the wrong cube is never processed silently.
    #[error("ambiguous input: `{pattern}` matches {} files in {}", matches.len(), dir.display())]
    AmbiguousMatch {
        pattern: String,
        dir: PathBuf,
        matches: Vec<PathBuf>,
    },

    /// The toolkit init script itself failed. Fatal: every subsequent
    /// toolkit call in the batch would also fail.
    #[error("toolkit environment failed to initialize: {detail}")]
    ToolchainNotInitialized { detail: String },

    /// The resolved binary does not exist on the initialized path.
    #[error("tool `{tool}` not found on the initialized path")]
    ToolNotFound { tool: String },

    /// A toolkit command ran but exited nonzero.
    #[error("`{command}` exited with status {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A spectral range with zero or negative width, rejected before any
    /// toolkit call is made.
    #[error("degenerate range [{low}, {high}]: bounds must satisfy low < high")]
    DegenerateRange { low: f64, high: f64 },

    /// The named notebook kernel is not installed.
    #[error("kernel `{kernel}` is not available")]
    KernelNotFound { kernel: String },

    /// A notebook cell raised during execution.
    #[error("cell {cell_index} raised during execution: {exception}")]
    CellExecution {
        cell_index: usize,
        exception: String,
    },

    /// An external call exceeded its wall-clock bound. The child process is
    /// killed before this is surfaced.
    #[error("`{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// The statistics report was missing one or more required labels.
    /// `raw` keeps the full report text for diagnostics.
    #[error("statistics report missing required fields: {}", missing.join(", "))]
    StatsParse { missing: Vec<String>, raw: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error aborts the whole batch rather than one dataset.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ToolchainNotInitialized { .. })
    }

    /// Short stable name for manifest records and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::NoMatch { .. } => "no-match",
            Self::AmbiguousMatch { .. } => "ambiguous-match",
            Self::ToolchainNotInitialized { .. } => "toolchain-not-initialized",
            Self::ToolNotFound { .. } => "tool-not-found",
            Self::NonZeroExit { .. } => "nonzero-exit",
            Self::DegenerateRange { .. } => "degenerate-range",
            Self::KernelNotFound { .. } => "kernel-not-found",
            Self::CellExecution { .. } => "cell-execution",
            Self::Timeout { .. } => "timeout",
            Self::StatsParse { .. } => "stats-parse",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Verbatim diagnostic text from the underlying tool, when one exists.
    /// Surfaced in the batch summary so an operator can fix an environment
    /// or input problem without re-running in verbose mode.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::ToolchainNotInitialized { detail } => Some(detail),
            Self::NonZeroExit { stderr, .. } => Some(stderr),
            Self::CellExecution { exception, .. } => Some(exception),
            Self::StatsParse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}
