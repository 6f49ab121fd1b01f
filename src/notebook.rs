//! Headless execution of parameterized notebooks.
//!
//! A notebook is treated as a pure function from (document, parameter
//! bindings) to an execution result: the named parameters are bound by
//! rewriting the designated entry cell (the first code cell) of a copy of
//! the document, the copy runs top-to-bottom under the named kernel, and
//! whatever files it writes are its own business. No other cell is altered.

use crate::error::{PipelineError, Result};
use crate::toolkit::invoker::run_command;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// A typed parameter value, rendered as a source literal in the entry cell.
/// String escaping is shared by the Python and Julia kernels in use.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Str(String),
    Float(f64),
    Int(i64),
}

impl ParamValue {
    fn literal(&self) -> String {
        match self {
            Self::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Self::Float(v) => format!("{v}"),
            Self::Int(v) => format!("{v}"),
        }
    }
}

/// Seam for document execution, so the orchestrator is testable without a
/// Jupyter install.
#[async_trait]
pub trait DocumentExecutor: Send + Sync {
    async fn execute(
        &self,
        document: &Path,
        kernel: &str,
        parameters: &[(String, ParamValue)],
        timeout: Duration,
    ) -> Result<()>;
}

/// Executes notebooks via `jupyter nbconvert` in a headless kernel.
#[derive(Debug, Default)]
pub struct JupyterExecutor;

impl JupyterExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Prepend parameter bindings to the first code cell of the notebook.
/// Fails if the document has no code cell to bind into.
fn inject_parameters(
    notebook: &mut Value,
    document: &Path,
    parameters: &[(String, ParamValue)],
) -> Result<()> {
    let bindings: String = parameters
        .iter()
        .map(|(name, value)| format!("{} = {}\n", name, value.literal()))
        .collect();

    let cells = notebook
        .get_mut("cells")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| {
            PipelineError::Config(format!("{} is not a notebook", document.display()))
        })?;

    let entry = cells
        .iter_mut()
        .find(|cell| cell.get("cell_type").and_then(Value::as_str) == Some("code"))
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "{} has no code cell to bind parameters into",
                document.display()
            ))
        })?;

    match entry.get_mut("source") {
        Some(Value::String(source)) => {
            source.insert_str(0, &bindings);
        }
        Some(Value::Array(lines)) => {
            lines.insert(0, Value::String(bindings));
        }
        _ => {
            return Err(PipelineError::Config(format!(
                "{} entry cell has no source",
                document.display()
            )));
        }
    }
    Ok(())
}

/// Scan an executed notebook for the first cell that raised.
fn first_cell_error(notebook: &Value) -> Option<(usize, String)> {
    let cells = notebook.get("cells")?.as_array()?;
    for (index, cell) in cells.iter().enumerate() {
        let Some(outputs) = cell.get("outputs").and_then(Value::as_array) else {
            continue;
        };
        for output in outputs {
            if output.get("output_type").and_then(Value::as_str) == Some("error") {
                let ename = output.get("ename").and_then(Value::as_str).unwrap_or("Error");
                let evalue = output.get("evalue").and_then(Value::as_str).unwrap_or("");
                return Some((index, format!("{ename}: {evalue}")));
            }
        }
    }
    None
}

#[async_trait]
impl DocumentExecutor for JupyterExecutor {
    async fn execute(
        &self,
        document: &Path,
        kernel: &str,
        parameters: &[(String, ParamValue)],
        timeout: Duration,
    ) -> Result<()> {
        let contents = std::fs::read_to_string(document)?;
        let mut notebook: Value = serde_json::from_str(&contents)?;
        inject_parameters(&mut notebook, document, parameters)?;

        // The bound copy and its executed form live in a scratch directory;
        // the notebook's own outputs go wherever it writes them, relative to
        // the original document's directory.
        let scratch = tempfile::tempdir()?;
        let bound_path = scratch.path().join("bound.ipynb");
        std::fs::write(&bound_path, serde_json::to_string(&notebook)?)?;

        let workdir = match document.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let label = format!("jupyter nbconvert --execute {}", document.display());

        let mut command = Command::new("jupyter");
        command
            .arg("nbconvert")
            .arg("--to")
            .arg("notebook")
            .arg("--execute")
            .arg("--allow-errors")
            .arg(format!("--ExecutePreprocessor.kernel_name={kernel}"))
            .arg(format!("--ExecutePreprocessor.timeout={}", timeout.as_secs()))
            .arg("--output")
            .arg("executed")
            .arg("--output-dir")
            .arg(scratch.path())
            .arg(&bound_path)
            .current_dir(workdir);

        tracing::info!("Executing {} under kernel {}", document.display(), kernel);
        let output = run_command(command, timeout, &label).await.map_err(|e| {
            match e {
                PipelineError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    PipelineError::ToolNotFound {
                        tool: "jupyter".into(),
                    }
                }
                other => other,
            }
        })?;

        if output.exit_code != 0 {
            if output.stderr.contains("No such kernel") || output.stderr.contains("NoSuchKernel") {
                return Err(PipelineError::KernelNotFound {
                    kernel: kernel.to_string(),
                });
            }
            return Err(PipelineError::NonZeroExit {
                command: label,
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        // Cells are allowed to raise during execution so the failing cell
        // can be identified from the executed copy.
        let executed = std::fs::read_to_string(scratch.path().join("executed.ipynb"))?;
        let executed: Value = serde_json::from_str(&executed)?;
        if let Some((cell_index, exception)) = first_cell_error(&executed) {
            return Err(PipelineError::CellExecution {
                cell_index,
                exception,
            });
        }

        Ok(())
    }
}
