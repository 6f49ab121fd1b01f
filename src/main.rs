//! Cube reduction pipeline CLI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cube_reduce::{build_runtime, run_batch, DatasetConfig, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "cube-reduce")]
#[command(about = "Reduce spectral line cubes: moment maps, noise statistics, notebook products", long_about = None)]
struct Cli {
    /// Directory holding dataset configuration records
    #[arg(long, default_value = "configs", global = true)]
    config_dir: PathBuf,

    /// Root of the per-dataset data directories
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Glob pattern selecting configuration records
    #[arg(short, long, default_value = "*.json", global = true)]
    pattern: String,

    /// Toolkit install root (defaults to $STARLINK_DIR)
    #[arg(long, global = true)]
    starlink_dir: Option<PathBuf>,

    /// Science analysis notebook
    #[arg(long, default_value = "LMC_range1_psi.ipynb", global = true)]
    science_notebook: PathBuf,

    /// Visualization notebook
    #[arg(long, default_value = "LMC_VGT_visual.ipynb", global = true)]
    visual_notebook: PathBuf,

    /// Kernel for the science notebook
    #[arg(long, default_value = "julia-1.11", global = true)]
    science_kernel: String,

    /// Kernel for the visualization notebook
    #[arg(long, default_value = "python3", global = true)]
    visual_kernel: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for all matching configurations (default)
    Run,

    /// Validate matching configurations without running anything
    Validate,

    /// Write a sample configuration record
    GenerateConfig {
        /// Output path for the sample record
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },
}

impl Cli {
    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            config_dir: self.config_dir.clone(),
            data_dir: self.data_dir.clone(),
            pattern: self.pattern.clone(),
            science_notebook: self.science_notebook.clone(),
            visual_notebook: self.visual_notebook.clone(),
            science_kernel: self.science_kernel.clone(),
            visual_kernel: self.visual_kernel.clone(),
            ..OrchestratorConfig::default()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => run_command(&cli),
        Some(Commands::Validate) => validate_command(&cli),
        Some(Commands::GenerateConfig { output }) => generate_config_command(output),
    }
}

/// Exit codes: 0 every dataset Complete, 2 batch finished with failures,
/// 1 batch aborted before completing.
fn run_command(cli: &Cli) -> ExitCode {
    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(run_batch(cli.starlink_dir.clone(), cli.orchestrator_config()));
    match result {
        Ok(summary) => {
            println!("\n=== Pipeline Summary ===");
            print!("{summary}");
            if summary.all_complete() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(e) => {
            eprintln!("Pipeline aborted: {e}");
            ExitCode::from(1)
        }
    }
}

fn validate_command(cli: &Cli) -> ExitCode {
    let pattern = cli.config_dir.join(&cli.pattern);
    let paths: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
        Ok(entries) => entries.filter_map(|entry| entry.ok()).collect(),
        Err(e) => {
            eprintln!("Bad pattern {}: {e}", pattern.display());
            return ExitCode::from(1);
        }
    };

    if paths.is_empty() {
        eprintln!("No configurations match {}", pattern.display());
        return ExitCode::from(1);
    }

    let mut invalid = 0usize;
    for path in paths {
        match DatasetConfig::from_file(&path) {
            Ok(config) => println!("{}: ok ({})", path.display(), config.program_id),
            Err(e) => {
                invalid += 1;
                println!("{}: {e}", path.display());
            }
        }
    }

    if invalid == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

fn generate_config_command(output: &PathBuf) -> ExitCode {
    let sample = DatasetConfig::sample();
    let json = match serde_json::to_string_pretty(&sample) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Failed to serialize sample config: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = std::fs::write(output, json) {
        eprintln!("Failed to write {}: {e}", output.display());
        return ExitCode::from(1);
    }
    println!("Generated sample configuration at: {}", output.display());
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default_is_run() {
        let cli = Cli::try_parse_from(["cube-reduce"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.pattern, "*.json");
    }

    #[test]
    fn test_cli_parse_with_overrides() {
        let cli = Cli::try_parse_from([
            "cube-reduce",
            "--config-dir",
            "other_configs",
            "-p",
            "M09*.json",
            "run",
        ])
        .unwrap();
        assert_eq!(cli.config_dir, PathBuf::from("other_configs"));
        assert_eq!(cli.pattern, "M09*.json");
    }

    #[test]
    fn test_cli_parse_generate_config() {
        let cli =
            Cli::try_parse_from(["cube-reduce", "generate-config", "-o", "sample.json"]).unwrap();
        match cli.command {
            Some(Commands::GenerateConfig { output }) => {
                assert_eq!(output, PathBuf::from("sample.json"));
            }
            _ => panic!("expected generate-config"),
        }
    }
}
