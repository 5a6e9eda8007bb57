//! One fit batch, end to end
//!
//! ```text
//! selection mode ─▶ Selector ─▶ LockCoordinator ─▶ Dispatcher ─▶ BatchSummary
//!                     │              │  lease renewal     │
//!                     └──────────────┴─────── Catalog ◀───┘ ResultRecorder
//! ```
//!
//! Selection and claim failures abort the batch. Once targets are claimed,
//! every outcome is per-target and the batch always runs to its summary,
//! unless the shutdown signal fires first. The lease is released either way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{Error, Result};
use crate::fit::{FitExecutor, Recalibrator};
use crate::lease::LockCoordinator;
use crate::metrics;
use crate::models::{BatchSummary, SelectionMode};
use crate::recorder::ResultRecorder;
use crate::selector::Selector;

/// Runs fit batches against a shared catalog
pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    selector: Selector,
    coordinator: LockCoordinator,
    dispatcher: Dispatcher,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        selector: Selector,
        coordinator: LockCoordinator,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            catalog,
            selector,
            coordinator,
            dispatcher,
        }
    }

    /// Wire every component from configuration
    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        executor: Arc<dyn FitExecutor>,
        recalibrator: Arc<dyn Recalibrator>,
    ) -> Self {
        let orch = &config.orchestrator;
        let recorder = ResultRecorder::with_retry(
            Arc::clone(&catalog),
            orch.record_retries,
            Duration::from_millis(orch.record_backoff_ms),
        );
        let dispatcher = Dispatcher::with_recalibrator(
            DispatcherConfig {
                workers: orch.workers,
                cores_per_fit: config.cores_per_fit(),
                fit_timeout: config.fit_timeout(),
                recalibrate_prefixes: orch.recalibrate_prefixes.clone(),
            },
            executor,
            recalibrator,
            recorder,
        );

        Self::new(
            Arc::clone(&catalog),
            Selector::new(orch.refit_window_hours),
            LockCoordinator::new(catalog, config.lease_ttl()),
            dispatcher,
        )
    }

    /// Lease holder id of this instance
    pub fn holder(&self) -> &str {
        self.coordinator.holder()
    }

    /// Run one batch for a selection-mode string
    pub async fn run(&self, mode: &str) -> Result<BatchSummary> {
        self.run_until(mode, std::future::pending()).await
    }

    /// Run one batch, stopping early if `shutdown` completes.
    ///
    /// An interrupted batch releases its lease and returns
    /// [`Error::Interrupted`]; outcomes recorded so far stay.
    pub async fn run_until<F>(&self, mode: &str, shutdown: F) -> Result<BatchSummary>
    where
        F: Future<Output = ()>,
    {
        let mode: SelectionMode = mode.parse()?;
        let mut rng = StdRng::from_entropy();
        self.run_mode(&mode, Utc::now(), &mut rng, shutdown).await
    }

    /// Run one batch for a parsed mode as of `now`
    pub async fn run_mode<R, F>(
        &self,
        mode: &SelectionMode,
        now: DateTime<Utc>,
        rng: &mut R,
        shutdown: F,
    ) -> Result<BatchSummary>
    where
        R: Rng + ?Sized,
        F: Future<Output = ()>,
    {
        let mode_label = mode.to_string();
        let _timer = metrics::start_batch_timer(&mode_label);
        info!(mode = %mode_label, holder = %self.holder(), "Starting fit batch");

        let candidates = self
            .selector
            .select(self.catalog.as_ref(), mode, now, rng)
            .await?;
        let selected = candidates.len();

        let mut lease = self.coordinator.claim_batch(&candidates).await?;
        let excluded = lease.excluded();
        let targets = lease.take_targets();
        let claimed = targets.len();
        metrics::record_claim(claimed, excluded);

        lease.start_renewal();

        let dispatched = tokio::select! {
            summary = self.dispatcher.dispatch(targets) => Some(summary),
            _ = shutdown => None,
        };

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Failed to release lease; rows stay held until expiry");
        }

        let Some(mut summary) = dispatched else {
            warn!(mode = %mode_label, "Fit batch interrupted");
            return Err(Error::Interrupted);
        };

        summary.selected = selected;
        summary.claimed = claimed;
        summary.excluded = excluded;

        info!(
            mode = %mode_label,
            selected,
            claimed,
            excluded,
            fitted = summary.fitted,
            skipped = summary.skipped,
            failed = summary.failed,
            unrecorded = summary.unrecorded,
            "Fit batch completed"
        );
        if !summary.failed_targets.is_empty() {
            warn!(targets = ?summary.failed_targets, "Targets failed this batch");
        }

        Ok(summary)
    }
}
