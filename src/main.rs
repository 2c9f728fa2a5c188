//! PACS Deploy CLI
//!
//! Usage:
//!   deploy                              # auto-detect mode, apply and validate
//!   deploy --mode native_systemd        # force a mode
//!   deploy --dry-run --output-dir ./out # only write configuration
//!
//! Exit codes: 0 success, 1 probe/plan/config failure, 2 apply failure, 3 validation failure

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use pacs_deploy::config::env::constants::{DEFAULT_LOG_DIR, DEFAULT_OUTPUT_DIR};
use pacs_deploy::domain::{DeployStage, DeploymentMode};
use pacs_deploy::{logging, DeploymentOrchestrator, EnvConfig, RunOptions};

#[derive(Parser)]
#[command(name = "deploy", version)]
#[command(about = "Probe the host, pick a deployment mode and deploy the PACS stack")]
struct Cli {
    /// Deployment mode: auto, docker_full, docker_minimal or native_systemd
    #[arg(long, default_value = "auto", value_parser = parse_mode)]
    mode: ModeSelection,

    /// Stop after writing configuration (no commands are run)
    #[arg(long)]
    dry_run: bool,

    /// Directory for generated configuration
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Directory for run logs
    #[arg(long, env = "DEPLOY_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Increase console verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, Debug)]
enum ModeSelection {
    Auto,
    Fixed(DeploymentMode),
}

fn parse_mode(s: &str) -> Result<ModeSelection, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(ModeSelection::Auto);
    }
    s.parse::<DeploymentMode>()
        .map(ModeSelection::Fixed)
        .map_err(|e| e.to_string())
}

fn print_summary(stages: &[DeployStage]) {
    println!();
    println!("=== Deployment Summary ===");
    for stage in stages {
        println!("  {}", stage.summary_line());
    }
}

fn exit_with(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log = match logging::init(cli.verbose, &cli.log_dir)
        .with_context(|| format!("cannot create log directory {}", cli.log_dir.display()))
    {
        Ok(log) => log,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return exit_with(1);
        }
    };

    let config = match EnvConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("log file: {}", log.path.display());
            return exit_with(e.exit_code());
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping deployment");
                cancel.cancel();
            }
        });
    }

    let options = RunOptions {
        mode_override: match cli.mode {
            ModeSelection::Auto => None,
            ModeSelection::Fixed(mode) => Some(mode),
        },
        dry_run: cli.dry_run,
        output_dir: cli.output_dir.clone(),
    };

    let orchestrator = DeploymentOrchestrator::new(config, cancel);
    match orchestrator.run(&options).await {
        Ok(report) => {
            print_summary(&report.stages);
            println!();
            println!(
                "{} ({}, {} workers) - configuration in {}",
                report.state,
                report.mode,
                report.sizing.worker_count,
                display_dir(&options.output_dir)
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            print_summary(&failure.stages);
            eprintln!();
            eprintln!("last completed state: {}", failure.last_completed);
            eprintln!("failed step: {} (in {})", failure.step, failure.failed_state);
            eprintln!("error: {}", failure.source);
            eprintln!("log file: {}", log.path.display());
            exit_with(failure.exit_code())
        }
    }
}

fn display_dir(dir: &Path) -> String {
    std::path::absolute(dir)
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}
