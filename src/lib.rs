//! mop-orchestrator - Batch fitting of microlensing candidates
//!
//! Selects candidate targets from a shared catalog, claims them with
//! skip-on-contention leases so several instances can run side by side, runs
//! an external model fit for each claimed target on a bounded worker pool, and
//! writes every outcome back to the catalog.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`catalog`] - Shared target store (SQLite, PostgreSQL, in-memory)
//! - [`selector`] - Selection modes to candidate lists
//! - [`lease`] - Skip-locked claims with background renewal
//! - [`dispatcher`] - Bounded worker pool, routing rules, fault isolation
//! - [`recorder`] - Transactional per-target outcome writes
//! - [`fit`] - External fitter and recalibration seams
//! - [`orchestrator`] - One batch, end to end
//! - [`brokers`] - Alert ingestion and name resolution
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus counters and histograms
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mop_orchestrator::config::Config;
//! use mop_orchestrator::fit::{CommandFitExecutor, NoopRecalibrator};
//! use mop_orchestrator::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let catalog = mop_orchestrator::catalog::open(&config.catalog).await?;
//!     let executor = Arc::new(CommandFitExecutor::new("pspl-fit", Vec::new()));
//!     let orchestrator =
//!         Orchestrator::from_config(&config, catalog, executor, Arc::new(NoopRecalibrator));
//!     let summary = orchestrator.run("alive").await?;
//!     println!("fitted {}", summary.fitted);
//!     Ok(())
//! }
//! ```

pub mod brokers;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fit;
pub mod lease;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod recorder;
pub mod selector;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{Catalog, MemoryCatalog, SqliteCatalog};
    pub use crate::config::Config;
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig};
    pub use crate::error::{Error, ErrorCategory, OrchestratorErrorTrait, Result};
    pub use crate::fit::{FitExecutor, Recalibrator};
    pub use crate::lease::LockCoordinator;
    pub use crate::models::{
        BatchSummary, FitOutcome, FitParameters, SelectionMode, SkyPosition, Target,
    };
    pub use crate::orchestrator::Orchestrator;
    pub use crate::recorder::ResultRecorder;
    pub use crate::selector::Selector;
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{BatchSummary, FitOutcome, SelectionMode, Target};
