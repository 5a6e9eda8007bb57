//! Unified error handling for the orchestrator crate
//!
//! Domain-specific errors live in [`crate::utils::error`]; this module wraps
//! them into a single [`Error`] enum so batch-level code can use `?` across
//! module boundaries.
//!
//! # Architecture
//!
//! - [`OrchestratorErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use mop_orchestrator::error::{Error, OrchestratorErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_batch_fatal() {
//!         eprintln!("Batch aborted: {err}");
//!     } else {
//!         tracing::warn!(error = %err, "Per-target failure");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::utils::error::{
    BrokerError, CatalogError, FitError, RecordingError, SelectionError,
};

/// Common trait for all orchestrator error types
pub trait OrchestratorErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Selection-mode parsing
    Selection,
    /// Catalog connectivity and queries
    Catalog,
    /// Per-target fit failures
    Fit,
    /// Per-target outcome persistence
    Recording,
    /// External broker traffic
    Broker,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Short lowercase label used in log fields and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Selection => "selection",
            Self::Catalog => "catalog",
            Self::Fit => "fit",
            Self::Recording => "recording",
            Self::Broker => "broker",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the orchestrator crate
#[derive(Error, Debug)]
pub enum Error {
    /// Selection-mode errors
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Catalog errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Fit errors
    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    /// Recording errors
    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    /// Broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Batch stopped by a shutdown signal
    #[error("Batch interrupted")]
    Interrupted,
}

impl OrchestratorErrorTrait for SelectionError {
    fn is_recoverable(&self) -> bool {
        false
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Selection
    }
}

impl OrchestratorErrorTrait for CatalogError {
    fn is_recoverable(&self) -> bool {
        match self {
            // SQLITE_BUSY / SQLITE_LOCKED clear up once the other writer commits
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Connection(_) | Self::Pool(_) | Self::Postgres(_) => true,
            Self::Sqlite(_) | Self::CorruptAttribute { .. } | Self::TargetNotFound(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Catalog
    }
}

impl OrchestratorErrorTrait for FitError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ProcessFailed(_))
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Fit
    }
}

impl OrchestratorErrorTrait for RecordingError {
    fn is_recoverable(&self) -> bool {
        self.source.is_recoverable()
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Recording
    }
}

impl OrchestratorErrorTrait for BrokerError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Http(_))
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Broker
    }
}

impl OrchestratorErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Selection(e) => e.is_recoverable(),
            Self::Catalog(e) => e.is_recoverable(),
            Self::Fit(e) => e.is_recoverable(),
            Self::Recording(e) => e.is_recoverable(),
            Self::Broker(e) => e.is_recoverable(),
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Interrupted => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Selection(_) => ErrorCategory::Selection,
            Self::Catalog(_) => ErrorCategory::Catalog,
            Self::Fit(_) => ErrorCategory::Fit,
            Self::Recording(_) => ErrorCategory::Recording,
            Self::Broker(_) => ErrorCategory::Broker,
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) | Self::Interrupted => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error aborts the whole batch rather than one target
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Selection | ErrorCategory::Catalog | ErrorCategory::Config
        )
    }
}

// Conversion from rusqlite::Error
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Catalog(CatalogError::Sqlite(err))
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        let err = Error::Selection(SelectionError::InvalidSelectionMode("bogus".into()));
        assert_eq!(err.category(), ErrorCategory::Selection);

        let err = Error::Fit(FitError::NonConvergence("chi2 diverged".into()));
        assert_eq!(err.category(), ErrorCategory::Fit);
    }

    #[test]
    fn test_batch_fatal() {
        let selection = Error::from(SelectionError::InvalidSelectionMode("x".into()));
        assert!(selection.is_batch_fatal());

        let catalog = Error::from(CatalogError::Connection("refused".into()));
        assert!(catalog.is_batch_fatal());

        let fit = Error::from(FitError::Timeout(10));
        assert!(!fit.is_batch_fatal());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::from(FitError::Timeout(5)).is_recoverable());
        assert!(!Error::from(FitError::BadData("no photometry".into())).is_recoverable());
        assert!(!Error::config("zero workers").is_recoverable());
    }

    #[test]
    fn test_recording_error_inherits_recoverability() {
        let err = RecordingError {
            target: "Gaia21abc".into(),
            attempts: 2,
            source: CatalogError::Connection("reset".into()),
        };
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Recording);
        assert!(err.to_string().contains("Gaia21abc"));
    }

    #[test]
    fn test_rusqlite_conversion() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Catalog(CatalogError::Sqlite(_))));
    }

    #[test]
    fn test_interrupted_and_io_fall_under_other() {
        assert_eq!(Error::Interrupted.category(), ErrorCategory::Other);
        assert!(!Error::Interrupted.is_batch_fatal());
        assert!(!Error::Interrupted.is_recoverable());

        let io = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io.category(), ErrorCategory::Other);
        assert!(io.is_recoverable());
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(ErrorCategory::Fit.as_str(), "fit");
        assert_eq!(ErrorCategory::Catalog.as_str(), "catalog");
    }
}
