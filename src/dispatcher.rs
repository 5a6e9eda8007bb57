//! Bounded worker pool for the fit step
//!
//! Producer-consumer over tokio `mpsc` channels: claimed targets go into a
//! job queue, `N` workers pull from it, and a collector folds the results into
//! a [`BatchSummary`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Claimed    │     │   Worker    │     │ Per-target  │     │  Result     │
//! │  targets    │────▶│   (x N)     │────▶│    task     │────▶│  collector  │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            │       recalibrate → route → fit
//!                            │                   │
//!                            └──── ResultRecorder (one write per target)
//! ```
//!
//! Each target runs in its own spawned task, so a panicking fit surfaces as a
//! `JoinError` and becomes that target's `Failed` outcome. A worker awaits its
//! target task before pulling the next job, which caps in-flight fits at `N`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::fit::{FitExecutor, NoopRecalibrator, Recalibrator};
use crate::metrics;
use crate::models::{BatchSummary, FitOutcome, Target};
use crate::recorder::ResultRecorder;
use crate::utils::error::FitError;
use crate::utils::truncate_text;

/// Reason recorded for targets routed away from the numeric fit
pub const SKIP_NOT_MICROLENSING: &str = "not classified as microlensing";

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Core budget passed to each fit
    pub cores_per_fit: usize,

    /// Per-target limit covering recalibration and the fit
    pub fit_timeout: Duration,

    /// Name prefixes of alert sources whose targets need error recalibration
    pub recalibrate_prefixes: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let workers = crate::config::default_workers();
        Self {
            workers,
            cores_per_fit: crate::config::split_cores(workers, workers),
            fit_timeout: Duration::from_secs(3600),
            recalibrate_prefixes: vec!["Gaia".to_string()],
        }
    }
}

// ============================================================================
// Job types
// ============================================================================

/// A claimed target waiting for a worker
#[derive(Debug)]
struct FitJob {
    job_id: u64,
    target: Target,
}

/// Result message for the collector
#[derive(Debug)]
struct JobResult {
    target: String,
    outcome: FitOutcome,
    recorded: bool,
}

/// Aborts the task when dropped, so an abandoned batch stops its fits
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Shared per-worker state
struct WorkerContext {
    executor: Arc<dyn FitExecutor>,
    recalibrator: Arc<dyn Recalibrator>,
    recorder: ResultRecorder,
    config: DispatcherConfig,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Runs the fit step over claimed targets with bounded concurrency
pub struct Dispatcher {
    context: Arc<WorkerContext>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        executor: Arc<dyn FitExecutor>,
        recorder: ResultRecorder,
    ) -> Self {
        Self::with_recalibrator(config, executor, Arc::new(NoopRecalibrator), recorder)
    }

    pub fn with_recalibrator(
        config: DispatcherConfig,
        executor: Arc<dyn FitExecutor>,
        recalibrator: Arc<dyn Recalibrator>,
        recorder: ResultRecorder,
    ) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                executor,
                recalibrator,
                recorder,
                config,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.context.config
    }

    /// Process every target and return the outcome counts.
    ///
    /// Per-target failures never abort the batch. Dropping the returned
    /// future aborts the workers and any fit still running.
    pub async fn dispatch(&self, targets: Vec<Target>) -> BatchSummary {
        let workers = self.context.config.workers.max(1);
        let buffer = targets.len().max(1);

        info!(
            total = targets.len(),
            workers,
            cores_per_fit = self.context.config.cores_per_fit,
            timeout_secs = self.context.config.fit_timeout.as_secs(),
            "Starting dispatch"
        );

        let (job_tx, job_rx) = mpsc::channel::<FitJob>(buffer);
        let (result_tx, mut result_rx) = mpsc::channel::<JobResult>(buffer);

        let worker_handles = self.spawn_workers(workers, job_rx, result_tx);

        let mut collector = AbortOnDrop(tokio::spawn(async move {
            let mut summary = BatchSummary::default();
            while let Some(result) = result_rx.recv().await {
                match &result.outcome {
                    FitOutcome::Fitted(_) => summary.fitted += 1,
                    FitOutcome::Skipped(_) => summary.skipped += 1,
                    FitOutcome::Failed(_) => {
                        summary.failed += 1;
                        summary.failed_targets.push(result.target.clone());
                    }
                }
                if !result.recorded {
                    summary.unrecorded += 1;
                }
                metrics::record_outcome(result.outcome.status());
            }
            summary
        }));

        for (idx, target) in targets.into_iter().enumerate() {
            let job = FitJob {
                job_id: idx as u64,
                target,
            };
            if job_tx.send(job).await.is_err() {
                tracing::error!("Failed to queue fit job - channel closed");
                break;
            }
        }

        // Close the queue so workers exit once it drains
        drop(job_tx);

        for mut handle in worker_handles {
            if let Err(e) = (&mut handle.0).await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }

        let summary = match (&mut collector.0).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "Result collector ended abnormally");
                BatchSummary::default()
            }
        };

        info!(
            fitted = summary.fitted,
            skipped = summary.skipped,
            failed = summary.failed,
            unrecorded = summary.unrecorded,
            "Dispatch completed"
        );

        summary
    }

    fn spawn_workers(
        &self,
        workers: usize,
        job_rx: mpsc::Receiver<FitJob>,
        result_tx: mpsc::Sender<JobResult>,
    ) -> Vec<AbortOnDrop<()>> {
        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let context = Arc::clone(&self.context);

            let handle = tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        rx.recv().await
                    };

                    let Some(job) = job else {
                        break; // Queue drained
                    };

                    let result = run_job(worker_id, &context, job).await;
                    if result_tx.send(result).await.is_err() {
                        tracing::error!(worker_id, "Result channel closed");
                        break;
                    }
                }

                debug!(worker_id, "Fit worker shutting down");
            });

            handles.push(AbortOnDrop(handle));
        }

        handles
    }
}

/// Process one job in an isolated task and record its outcome
async fn run_job(worker_id: usize, context: &Arc<WorkerContext>, job: FitJob) -> JobResult {
    let name = job.target.name.clone();
    let started = Instant::now();
    info!(worker_id, job_id = job.job_id, target = %name, "Processing target");

    let task_context = Arc::clone(context);
    let target = job.target;
    let mut task = AbortOnDrop(tokio::spawn(async move {
        process_target(&task_context, &target).await
    }));

    let outcome = match (&mut task.0).await {
        Ok(outcome) => outcome,
        Err(e) => FitOutcome::Failed(join_error_to_fit_error(e)),
    };

    let elapsed = started.elapsed();
    match &outcome {
        FitOutcome::Fitted(params) => info!(
            target = %name,
            t0 = params.t0,
            u0 = params.u0,
            te = params.te,
            elapsed_ms = elapsed.as_millis() as u64,
            "Fit succeeded"
        ),
        FitOutcome::Skipped(reason) => info!(target = %name, reason = %reason, "Target skipped"),
        FitOutcome::Failed(err) => warn!(
            target = %name,
            error = %err,
            elapsed_ms = elapsed.as_millis() as u64,
            "Fit failed"
        ),
    }
    metrics::observe_target_seconds(elapsed.as_secs_f64());

    // One stamp per target, reused by any retry inside the recorder
    let recorded_at = Utc::now();
    let recorded = context
        .recorder
        .record(&name, &outcome, recorded_at)
        .await
        .is_ok();

    JobResult {
        target: name,
        outcome,
        recorded,
    }
}

/// Route one target under the per-target deadline
async fn process_target(context: &WorkerContext, target: &Target) -> FitOutcome {
    let deadline = context.config.fit_timeout;
    match tokio::time::timeout(deadline, route_and_fit(context, target)).await {
        Ok(outcome) => outcome,
        Err(_) => FitOutcome::Failed(FitError::Timeout(deadline.as_secs())),
    }
}

/// Recalibrate when the prefix asks for it, skip non-events, then fit
async fn route_and_fit(context: &WorkerContext, target: &Target) -> FitOutcome {
    let config = &context.config;

    if needs_recalibration(&target.name, &config.recalibrate_prefixes) {
        debug!(target = %target.name, "Recalibrating photometric errors");
        if let Err(e) = context.recalibrator.recalibrate(target).await {
            return FitOutcome::Failed(e);
        }
    }

    if !target.is_microlensing() {
        return FitOutcome::Skipped(SKIP_NOT_MICROLENSING.to_string());
    }

    match context.executor.fit(target, config.cores_per_fit.max(1)).await {
        Ok(params) => FitOutcome::Fitted(params),
        Err(e) => FitOutcome::Failed(e),
    }
}

fn needs_recalibration(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
}

fn join_error_to_fit_error(err: JoinError) -> FitError {
    if err.is_cancelled() {
        return FitError::Cancelled;
    }

    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    FitError::Panicked(truncate_text(&message, 256))
}
