use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(
    name = "mop-fit",
    version,
    about = "Batch model fitting for microlensing candidates in a shared catalog",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (overrides logging.level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format, text or json (overrides logging.format)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Select, claim and fit one batch of targets
    Fit {
        /// Selection mode: all, alive, need, or a year list like [2023,2024]
        selection: String,

        /// Worker count (default: host core count)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        cores: Option<u64>,

        /// Cores handed to each fit (default: host cores divided by workers)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        cores_per_fit: Option<u64>,

        /// TOML configuration file (default: environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SQLite catalog path; selects the SQLite backend
        #[arg(long)]
        database: Option<PathBuf>,

        /// Fitter program
        #[arg(long)]
        fit_command: Option<String>,

        /// Per-target fit timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Write Prometheus metrics in text format here after the batch
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },

    /// Show catalog counts and live leases
    Status {
        /// TOML configuration file (default: environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SQLite catalog path; selects the SQLite backend
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Look up a target's classification on the Transient Name Server
    Classify {
        /// Target name in the catalog
        name: String,

        /// Name to query TNS with, when it differs from the catalog name
        #[arg(long)]
        tns_name: Option<String>,

        /// Store the classification on the target
        #[arg(long, default_value = "false")]
        update: bool,

        /// TOML configuration file (default: environment variables)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// SQLite catalog path; selects the SQLite backend
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Self::Fit { config, .. }
            | Self::Status { config, .. }
            | Self::Classify { config, .. } => config.as_deref(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing/logging
    let logging = commands::logging_config(cli.command.config_path());
    let format = cli.log_format.as_deref().unwrap_or(&logging.format);
    if let Err(e) = setup_tracing(format, &logging.level, cli.verbose) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "mop-fit aborted");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Fit {
            selection,
            cores,
            cores_per_fit,
            config,
            database,
            fit_command,
            timeout,
            metrics_out,
        } => {
            tracing::info!(
                selection = %selection,
                cores = ?cores,
                config = ?config,
                database = ?database,
                timeout = ?timeout,
                "Starting fit command"
            );
            commands::fit(commands::FitParams {
                selection,
                cores: cores.map(|c| c as usize),
                cores_per_fit: cores_per_fit.map(|c| c as usize),
                config,
                database,
                fit_command,
                timeout,
                metrics_out,
            })
            .await
        }

        Commands::Status { config, database } => {
            commands::status(config, database).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Classify {
            name,
            tns_name,
            update,
            config,
            database,
        } => {
            tracing::info!(name = %name, update, "Starting classify command");
            commands::classify(name, tns_name, update, config, database).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Filter directives: `level` for this crate, one step quieter for the rest
fn filter_directives(level: &str, verbose: bool) -> String {
    let (ours, others) = match (verbose, level) {
        (true, _) => ("debug", "info"),
        (false, "trace") => ("trace", "debug"),
        (false, "debug") => ("debug", "info"),
        (false, "warn") => ("warn", "error"),
        (false, "error") => ("error", "error"),
        _ => ("info", "warn"),
    };
    format!("mop_orchestrator={ours},mop_fit={ours},{others}")
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(filter_directives(level, verbose));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_follows_configured_level() {
        assert_eq!(
            filter_directives("info", false),
            "mop_orchestrator=info,mop_fit=info,warn"
        );
        assert_eq!(
            filter_directives("warn", false),
            "mop_orchestrator=warn,mop_fit=warn,error"
        );
        assert_eq!(
            filter_directives("trace", false),
            "mop_orchestrator=trace,mop_fit=trace,debug"
        );
    }

    #[test]
    fn test_verbose_overrides_level() {
        assert_eq!(
            filter_directives("error", true),
            "mop_orchestrator=debug,mop_fit=debug,info"
        );
    }

    #[test]
    fn test_config_path_per_command() {
        let cli = Cli::parse_from(["mop-fit", "status", "--config", "mop.toml"]);
        assert_eq!(cli.command.config_path(), Some(Path::new("mop.toml")));
        assert!(cli.log_format.is_none());

        let cli = Cli::parse_from(["mop-fit", "--log-format", "json", "fit", "alive"]);
        assert!(cli.command.config_path().is_none());
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
