use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};

use mop_orchestrator::catalog;
use mop_orchestrator::config::Config;
use mop_orchestrator::error::OrchestratorErrorTrait;
use mop_orchestrator::fit::{
    CommandFitExecutor, CommandRecalibrator, FitExecutor, NoopRecalibrator, Recalibrator,
};
use mop_orchestrator::metrics;
use mop_orchestrator::orchestrator::Orchestrator;
use mop_orchestrator::{BatchSummary, Error};

/// Exit status for a batch stopped by Ctrl-C
const EXIT_INTERRUPTED: u8 = 130;

/// Command-line options for one fit batch
pub struct FitParams {
    pub selection: String,
    pub cores: Option<usize>,
    pub cores_per_fit: Option<usize>,
    pub config: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub fit_command: Option<String>,
    pub timeout: Option<u64>,
    pub metrics_out: Option<PathBuf>,
}

pub async fn fit(params: FitParams) -> Result<ExitCode> {
    let mut config = super::load_config(params.config.as_deref(), params.database)?;
    if let Some(cores) = params.cores {
        config.orchestrator.workers = cores;
    }
    if let Some(cores_per_fit) = params.cores_per_fit {
        config.orchestrator.cores_per_fit = Some(cores_per_fit);
    }
    if let Some(timeout) = params.timeout {
        config.orchestrator.fit_timeout_secs = timeout;
    }
    if let Some(command) = params.fit_command {
        config.fit.command = Some(command);
    }
    config.validate()?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed; continuing without metrics");
    }

    let (executor, recalibrator) = build_fit_step(&config)?;
    let catalog = catalog::open(&config.catalog)
        .await
        .context("Failed to open catalog")?;
    let orchestrator = Orchestrator::from_config(&config, catalog, executor, recalibrator);

    println!("Starting fit batch");
    println!("==================");
    println!("Selection: {}", params.selection);
    println!("Workers: {}", config.orchestrator.workers);
    println!("Cores per fit: {}", config.cores_per_fit());
    println!("Holder: {}", orchestrator.holder());

    let result = orchestrator
        .run_until(&params.selection, shutdown_signal())
        .await;

    if let Some(path) = &params.metrics_out {
        write_metrics(path);
    }

    match result {
        Ok(summary) => {
            print_summary(&summary);
            Ok(ExitCode::SUCCESS)
        }
        Err(Error::Interrupted) => {
            println!("\nBatch interrupted; lease released");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => {
            tracing::error!(category = e.category().as_str(), error = %e, "Fit batch aborted");
            Err(e.into())
        }
    }
}

fn build_fit_step(config: &Config) -> Result<(Arc<dyn FitExecutor>, Arc<dyn Recalibrator>)> {
    let program = config.fit.command.clone().context(
        "No fit command configured (use --fit-command, fit.command, or MOP_FIT_COMMAND)",
    )?;
    let executor: Arc<dyn FitExecutor> =
        Arc::new(CommandFitExecutor::new(program, config.fit.args.clone()));

    let recalibrator: Arc<dyn Recalibrator> = match &config.fit.recalibrate_command {
        Some(program) => Arc::new(CommandRecalibrator::new(program.clone(), Vec::new())),
        None => Arc::new(NoopRecalibrator),
    };

    Ok((executor, recalibrator))
}

/// Completes on Ctrl-C; never completes if the handler cannot be installed
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::warn!("Ctrl-C received, stopping batch");
}

fn write_metrics(path: &Path) {
    match metrics::encode_metrics() {
        Ok(text) => {
            if let Err(e) = std::fs::write(path, text) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }
}

fn print_summary(summary: &BatchSummary) {
    println!("\nBatch Summary");
    println!("=============");
    println!("Selected: {}", summary.selected);
    println!("Claimed: {}", summary.claimed);
    println!("Excluded (held elsewhere): {}", summary.excluded);
    println!("Fitted: {}", summary.fitted);
    println!("Skipped: {}", summary.skipped);
    println!("Failed: {}", summary.failed);
    if summary.unrecorded > 0 {
        println!("Unrecorded: {}", summary.unrecorded);
    }
    println!("Success rate: {:.1}%", summary.success_rate() * 100.0);

    if !summary.failed_targets.is_empty() {
        println!("\nFailed targets");
        println!("--------------");
        for name in &summary.failed_targets {
            println!("  {name}");
        }
    }
}
