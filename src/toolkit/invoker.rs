//! Shell-level invocation of the reduction toolkit.
//!
//! Toolkit commands only work inside a shell that has sourced the toolkit's
//! profile and loaded its package definitions, and none of that state
//! persists across processes. [`ToolkitEnv`] is the explicit handle for that
//! environment: constructing it proves the init sequence works (a failure
//! there is fatal for the whole batch), and every [`ToolkitRunner::run`] call
//! replays the sequence before the command itself.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured output of a finished toolkit command.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Seam for everything that issues toolkit commands. Stage runners depend on
/// this trait so tests can count and script invocations without a real
/// toolkit install.
#[async_trait]
pub trait ToolkitRunner: Send + Sync {
    /// Run one toolkit command (possibly a multi-line snippet) inside a
    /// freshly initialized shell. Returns the captured output on exit 0.
    async fn run(&self, command: &str, timeout: Duration) -> Result<ToolOutput>;
}

/// An initialized toolkit environment.
#[derive(Debug)]
pub struct ToolkitEnv {
    init_script: PathBuf,
    packages: Vec<String>,
}

impl ToolkitEnv {
    /// Initialize the environment rooted at `toolkit_dir` by sourcing
    /// `<toolkit_dir>/etc/profile` and loading the `convert` and `kappa`
    /// package definitions once, proving the toolchain loads. A failure here
    /// is [`PipelineError::ToolchainNotInitialized`] and aborts the batch.
    pub async fn initialize(toolkit_dir: &Path, timeout: Duration) -> Result<Self> {
        let env = Self {
            init_script: toolkit_dir.join("etc").join("profile"),
            packages: vec!["convert".into(), "kappa".into()],
        };

        if !env.init_script.is_file() {
            return Err(PipelineError::ToolchainNotInitialized {
                detail: format!("init script {} does not exist", env.init_script.display()),
            });
        }

        let probe = env.script_for(":");
        let output = run_bash(&probe, timeout, "toolkit init").await?;
        if output.exit_code != 0 {
            return Err(PipelineError::ToolchainNotInitialized {
                detail: output.stderr.trim().to_string(),
            });
        }

        tracing::info!("Toolkit environment initialized from {}", env.init_script.display());
        Ok(env)
    }

    /// Full shell script for one command: init sequence, then the command.
    /// errexit makes the first failing line the script's exit status, so a
    /// broken init line is never masked by a later command succeeding.
    fn script_for(&self, command: &str) -> String {
        let mut script = format!("set -e\nsource {}\n", self.init_script.display());
        for package in &self.packages {
            script.push_str(package);
            script.push('\n');
        }
        script.push_str(command);
        script.push('\n');
        script
    }
}

#[async_trait]
impl ToolkitRunner for ToolkitEnv {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ToolOutput> {
        let label = first_line(command);
        tracing::debug!("Toolkit: {}", label);

        let output = run_bash(&self.script_for(command), timeout, &label).await?;

        // Bash reserves 127 for command-not-found.
        if output.exit_code == 127 {
            let tool = command
                .split_whitespace()
                .next()
                .unwrap_or(command)
                .to_string();
            return Err(PipelineError::ToolNotFound { tool });
        }
        if output.exit_code != 0 {
            return Err(PipelineError::NonZeroExit {
                command: label,
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// Run a bash script with captured output and a wall-clock bound.
///
/// The child has kill-on-drop set, so an expired timeout dropping the wait
/// future also reaps the process; no orphans are left behind.
async fn run_bash(script: &str, timeout: Duration, label: &str) -> Result<ToolOutput> {
    let child = Command::new("bash")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(PipelineError::Timeout {
                command: label.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Same contract as [`run_bash`] but for a plain argv command, used by the
/// notebook executor.
pub(crate) async fn run_command(
    mut command: Command,
    timeout: Duration,
    label: &str,
) -> Result<ToolOutput> {
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(PipelineError::Timeout {
                command: label.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

fn first_line(command: &str) -> String {
    command
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(command)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_secs(10);

    /// Build a throwaway toolkit tree whose init script and packages are
    /// plain shell stubs.
    fn fake_toolkit_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let etc = dir.path().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(
            etc.join("profile"),
            "convert() { :; }\nkappa() { :; }\nexport TOOLKIT_READY=1\n",
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_initialize_missing_script_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ToolkitEnv::initialize(dir.path(), SHORT).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_initialize_failing_script_is_fatal() {
        let dir = fake_toolkit_dir();
        std::fs::write(
            dir.path().join("etc").join("profile"),
            "echo 'profile broken' >&2\nfalse\n",
        )
        .unwrap();

        let err = ToolkitEnv::initialize(dir.path(), SHORT).await.unwrap_err();
        match err {
            PipelineError::ToolchainNotInitialized { detail } => {
                assert!(detail.contains("profile broken"));
            }
            other => panic!("expected ToolchainNotInitialized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_sources_init_before_command() {
        let dir = fake_toolkit_dir();
        let env = ToolkitEnv::initialize(dir.path(), SHORT).await.unwrap();

        let output = env.run("echo ready=$TOOLKIT_READY", SHORT).await.unwrap();
        assert_eq!(output.stdout.trim(), "ready=1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let dir = fake_toolkit_dir();
        let env = ToolkitEnv::initialize(dir.path(), SHORT).await.unwrap();

        let err = env
            .run("echo 'bad NDF' >&2; exit 3", SHORT)
            .await
            .unwrap_err();
        match err {
            PipelineError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "bad NDF");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_maps_to_tool_not_found() {
        let dir = fake_toolkit_dir();
        let env = ToolkitEnv::initialize(dir.path(), SHORT).await.unwrap();

        let err = env
            .run("definitely_not_a_real_tool_1234 in=x", SHORT)
            .await
            .unwrap_err();
        match err {
            PipelineError::ToolNotFound { tool } => {
                assert_eq!(tool, "definitely_not_a_real_tool_1234");
            }
            other => panic!("expected ToolNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_and_surfaces() {
        let dir = fake_toolkit_dir();
        let env = ToolkitEnv::initialize(dir.path(), SHORT).await.unwrap();

        let err = env
            .run("sleep 30", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
    }
}
