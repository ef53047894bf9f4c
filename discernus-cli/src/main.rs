//! Command-line surface for the Discernus experiment execution core (§6).
//!
//! Three subcommands, each a thin shell around `discernus_core`:
//!
//! - `run <experiment_path>` — execute the full nine-step pipeline.
//! - `verify <experiment_path>` — run only the framework/data pre-flight.
//! - `stats <artifact_dir>` — re-run the Statistical Processor standalone
//!   over a directory of already-stored `analysis_result` artifacts.
//!
//! Exit codes follow §6 exactly: `0` success, `1` any component failure,
//! `2` pre-flight failure, `3` budget-exceeded.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use discernus_core::{
    ArtifactType, CancellationToken, Config, ContentStore, Error, IntegrityReport, Orchestrator,
    StatisticalProcessor,
};

#[derive(Parser, Debug)]
#[command(
    name = "discernus",
    version,
    about = "Run Discernus research experiments: framework scoring, adversarial verification, statistics, and narrative synthesis over a corpus."
)]
struct Cli {
    /// Optional TOML configuration file overlaying process defaults (§1.1).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the full pipeline over an experiment directory.
    Run {
        /// Path to the experiment directory or its `experiment.json`.
        experiment_path: PathBuf,
    },
    /// Run only the framework and data pre-flight checks (§4.11).
    Verify {
        /// Path to the experiment directory or its `experiment.json`.
        experiment_path: PathBuf,
    },
    /// Run the Statistical Processor standalone over a stored artifact set.
    Stats {
        /// Root of a content-addressable store containing `analysis_result` artifacts.
        artifact_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { experiment_path } => run_command(&experiment_path, cli.config.as_deref()).await,
        Command::Verify { experiment_path } => verify_command(&experiment_path, cli.config.as_deref()),
        Command::Stats { artifact_dir } => stats_command(&artifact_dir),
    }
}

async fn run_command(experiment_path: &std::path::Path, config_path: Option<&std::path::Path>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "failed to initialize orchestrator");
            return ExitCode::from(1);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested, draining in-flight work");
            ctrl_c_cancel.cancel();
        }
    });

    match orchestrator.run(experiment_path, cancel).await {
        Ok(outcome) => {
            info!(
                final_report = ?outcome.manifest.final_report_hash,
                manifest_path = ?outcome.manifest_path,
                "experiment completed"
            );
            println!("{}", serde_json::to_string_pretty(&outcome.manifest).unwrap_or_default());
            ExitCode::from(0)
        }
        Err(e) => {
            print_failure(&e);
            exit_code_for(&e)
        }
    }
}

fn verify_command(experiment_path: &std::path::Path, config_path: Option<&std::path::Path>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "failed to initialize orchestrator");
            return ExitCode::from(1);
        }
    };

    match orchestrator.preflight(experiment_path) {
        Ok((framework_report, data_report)) => {
            print_report("framework", &framework_report);
            print_report("data", &data_report);
            if framework_report.valid && data_report.valid {
                println!("pre-flight OK");
                ExitCode::from(0)
            } else {
                println!("pre-flight FAILED");
                ExitCode::from(2)
            }
        }
        Err(e) => {
            print_failure(&e);
            ExitCode::from(2)
        }
    }
}

fn stats_command(artifact_dir: &std::path::Path) -> ExitCode {
    let store = match ContentStore::open(artifact_dir) {
        Ok(s) => s,
        Err(e) => {
            print_failure(&e);
            return ExitCode::from(1);
        }
    };

    let hashes = match store.list(ArtifactType::AnalysisResult) {
        Ok(h) => h,
        Err(e) => {
            print_failure(&e);
            return ExitCode::from(1);
        }
    };

    let mut analyses = Vec::with_capacity(hashes.len());
    for hash in hashes {
        match store.get(ArtifactType::AnalysisResult, &hash) {
            Ok(a) => analyses.push(a),
            Err(e) => {
                print_failure(&e);
                return ExitCode::from(1);
            }
        }
    }

    let statistics = StatisticalProcessor::analyze(&analyses);
    match serde_json::to_string_pretty(&statistics) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::from(0)
        }
        Err(e) => {
            print_failure(&Error::from(e));
            ExitCode::from(1)
        }
    }
}

fn print_report(domain: &str, report: &IntegrityReport) {
    if report.valid {
        println!("{domain}: OK");
        return;
    }
    println!("{domain}: FAILED");
    for check in &report.failed_checks {
        println!("  - {check}");
    }
    for line in &report.guidance {
        println!("  > {line}");
    }
}

fn print_failure(error: &Error) {
    error!(error = %error, "run failed");
    eprintln!("error: {error}");
    if let Error::TransactionIntegrityError {
        domain,
        failed_checks,
        guidance,
    } = error
    {
        eprintln!("  domain: {domain}");
        for check in failed_checks {
            eprintln!("  failed: {check}");
        }
        for line in guidance {
            eprintln!("  remediation: {line}");
        }
    }
}

fn exit_code_for(error: &Error) -> ExitCode {
    match error {
        Error::BudgetExceeded { .. } => ExitCode::from(3),
        Error::TransactionIntegrityError { .. } => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}
