//! Persists per-target outcomes
//!
//! Each outcome is applied to the target's attributes in a single catalog
//! transaction. A failed write is retried once after a short backoff with the
//! same `recorded_at` stamp, so a write that landed but reported an error
//! converges on the same attributes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::catalog::Catalog;
use crate::error::OrchestratorErrorTrait;
use crate::models::FitOutcome;
use crate::utils::error::RecordingError;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Writes outcomes back to the catalog
#[derive(Clone)]
pub struct ResultRecorder {
    catalog: Arc<dyn Catalog>,
    retry: RetryConfig,
}

impl ResultRecorder {
    /// Recorder with one retry after 500ms
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self::with_retry(catalog, 1, Duration::from_millis(500))
    }

    pub fn with_retry(catalog: Arc<dyn Catalog>, retries: u32, backoff: Duration) -> Self {
        Self {
            catalog,
            retry: RetryConfig::new(retries, backoff, backoff.saturating_mul(4)),
        }
    }

    /// Apply `outcome` to the named target.
    ///
    /// Errors that cannot clear up on their own (missing target, corrupt row)
    /// are not retried.
    pub async fn record(
        &self,
        target: &str,
        outcome: &FitOutcome,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), RecordingError> {
        let result = with_retry_if(
            &self.retry,
            || self.catalog.record_outcome(target, outcome, recorded_at),
            |e| e.is_recoverable(),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(target = %target, status = outcome.status().as_str(), "Outcome recorded");
                Ok(())
            }
            Err(exhausted) => {
                error!(
                    target = %target,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Failed to record outcome"
                );
                Err(RecordingError {
                    target: target.to_string(),
                    attempts: exhausted.attempts,
                    source: exhausted.error,
                })
            }
        }
    }
}
