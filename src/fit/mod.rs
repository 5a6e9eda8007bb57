//! Fit step seams
//!
//! The numeric model fit is an external black box behind [`FitExecutor`].
//! Failures it reports are ordinary per-target outcomes; the dispatcher turns
//! them into [`FitOutcome::Failed`](crate::models::FitOutcome::Failed) and
//! carries on.

pub mod command;

use async_trait::async_trait;

use crate::models::{FitParameters, Target};
use crate::utils::error::FitError;

pub use command::{CommandFitExecutor, CommandRecalibrator};

/// Estimates model parameters from a target's observed time series
#[async_trait]
pub trait FitExecutor: Send + Sync {
    /// Fit one target using up to `cores` CPU cores.
    ///
    /// May run for a long time. Non-convergence and bad data are returned as
    /// errors, not swallowed.
    async fn fit(&self, target: &Target, cores: usize) -> Result<FitParameters, FitError>;
}

/// Recomputes photometric uncertainties for targets from a given alert source
#[async_trait]
pub trait Recalibrator: Send + Sync {
    async fn recalibrate(&self, target: &Target) -> Result<(), FitError>;
}

/// Recalibrator that leaves targets untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecalibrator;

#[async_trait]
impl Recalibrator for NoopRecalibrator {
    async fn recalibrate(&self, target: &Target) -> Result<(), FitError> {
        tracing::trace!(target = %target.name, "No recalibrator configured");
        Ok(())
    }
}
