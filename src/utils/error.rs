//! Domain error types for the fit orchestrator
//!
//! Each stage of a batch has its own error enum. Only [`SelectionError`] and
//! [`CatalogError`] are batch-fatal; the rest are caught per target.

use thiserror::Error;

/// Errors produced while turning a selection-mode string into candidates
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// Mode string is not `all`, `alive`, `need` or a bracketed year list
    #[error("Invalid selection mode '{0}': expected all, alive, need or [y1,y2,...]")]
    InvalidSelectionMode(String),

    /// Bracketed year list with no usable tokens
    #[error("Empty year list in selection mode '{0}'")]
    EmptyYearList(String),
}

/// Errors raised by a catalog backend
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Could not open or reach the catalog
    #[error("Catalog connection failed: {0}")]
    Connection(String),

    /// SQLite query or transaction failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL query or transaction failure
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// PostgreSQL pool could not hand out a connection
    #[error("PostgreSQL pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Stored attribute could not be decoded
    #[error("Corrupt attribute '{field}' on target '{target}': {reason}")]
    CorruptAttribute {
        target: String,
        field: String,
        reason: String,
    },

    /// Target does not exist
    #[error("Target not found: {0}")]
    TargetNotFound(String),
}

/// Per-target failures of the fit step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FitError {
    /// Fitter ran but did not converge
    #[error("Fit did not converge: {0}")]
    NonConvergence(String),

    /// Target data unusable for fitting
    #[error("Bad data: {0}")]
    BadData(String),

    /// Fitter did not finish before the deadline
    #[error("Fit timed out after {0}s")]
    Timeout(u64),

    /// Fitter task panicked
    #[error("Fit panicked: {0}")]
    Panicked(String),

    /// Fitter task was aborted before it finished
    #[error("Fit task cancelled")]
    Cancelled,

    /// External fitter process could not be run or exited abnormally
    #[error("Fit process failed: {0}")]
    ProcessFailed(String),

    /// Error recalibration ahead of the fit failed
    #[error("Error recalibration failed: {0}")]
    Recalibration(String),

    /// Fitter output could not be decoded
    #[error("Invalid fit output: {0}")]
    InvalidOutput(String),
}

/// Outcome persistence failed for one target
#[derive(Error, Debug)]
#[error("Failed to record outcome for '{target}' after {attempts} attempt(s): {source}")]
pub struct RecordingError {
    pub target: String,
    pub attempts: u32,
    #[source]
    pub source: CatalogError,
}

/// Errors talking to an external broker
#[derive(Error, Debug)]
pub enum BrokerError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Broker answered with an unexpected payload
    #[error("Unexpected broker response: {0}")]
    UnexpectedResponse(String),

    /// Nothing matched the lookup
    #[error("No match for '{0}'")]
    NotFound(String),

    /// Broker credentials missing
    #[error("Missing broker credential: {0}")]
    MissingCredential(String),
}
