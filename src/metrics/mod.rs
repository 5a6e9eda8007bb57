//! Prometheus metrics for fit batches
//!
//! Claims, per-target outcomes and batch durations are tracked in the default
//! registry. Nothing is recorded until [`init_metrics`] has run; until then
//! every recording call returns immediately. `mop-fit fit --metrics-out`
//! dumps the registry for a node-exporter textfile collector.

use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

use crate::models::FitStatus;

/// Container for all batch metrics
struct FitMetrics {
    outcomes: CounterVec,
    target_duration: Histogram,
    claimed: Counter,
    excluded: Counter,
    batch_duration: HistogramVec,
}

/// Global storage for batch metrics
static FIT_METRICS: OnceLock<FitMetrics> = OnceLock::new();

/// Set on the first `init_metrics` call, successful or not
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

/// Register the batch metrics with the default registry.
///
/// Only the first call registers anything; later calls return `Ok(())`.
/// A registration error leaves metrics disabled for the process.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = FitMetrics {
        outcomes: register_counter_vec!(
            "mop_fit_outcomes_total",
            "Per-target outcomes by status",
            &["status"]
        )?,
        target_duration: register_histogram!(
            "mop_fit_target_duration_seconds",
            "Time spent processing one target, recalibration and fit included",
            vec![0.1, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
        )?,
        claimed: register_counter!(
            "mop_fit_claimed_targets_total",
            "Candidates this instance took a lease on"
        )?,
        excluded: register_counter!(
            "mop_fit_excluded_targets_total",
            "Candidates skipped because another instance held them"
        )?,
        batch_duration: register_histogram_vec!(
            "mop_fit_batch_duration_seconds",
            "Wall-clock duration of a fit batch",
            &["mode"],
            vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]
        )?,
    };

    FIT_METRICS
        .set(metrics)
        .map_err(|_| "Fit metrics already initialized")?;

    tracing::debug!("Batch metrics registered");
    Ok(())
}

/// Whether registration succeeded
pub fn metrics_initialized() -> bool {
    FIT_METRICS.get().is_some()
}

/// Default registry in the Prometheus text exposition format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let mut text = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut text)?;
    Ok(String::from_utf8(text)?)
}

/// Record one target's outcome
pub fn record_outcome(status: FitStatus) {
    if let Some(m) = FIT_METRICS.get() {
        m.outcomes.with_label_values(&[status.as_str()]).inc();
    }
}

/// Record how long one target took
pub fn observe_target_seconds(secs: f64) {
    if let Some(m) = FIT_METRICS.get() {
        m.target_duration.observe(secs);
    }
}

/// Record the result of a claim
pub fn record_claim(claimed: usize, excluded: usize) {
    let Some(m) = FIT_METRICS.get() else {
        return;
    };

    if claimed > 0 {
        m.claimed.inc_by(claimed as f64);
    }
    if excluded > 0 {
        m.excluded.inc_by(excluded as f64);
    }
}

/// Observes the batch duration when dropped, interrupted batches included
pub struct MetricsTimer(Option<prometheus::HistogramTimer>);

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.0.take() {
            timer.observe_duration();
        }
    }
}

/// Start timing a batch for a selection mode
pub fn start_batch_timer(mode: &str) -> MetricsTimer {
    MetricsTimer(
        FIT_METRICS
            .get()
            .map(|m| m.batch_duration.with_label_values(&[mode]).start_timer()),
    )
}
