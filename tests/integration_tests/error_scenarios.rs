//! Error handling scenarios
//!
//! Batch-fatal failures (selection, catalog connectivity) versus per-target
//! failures that are recorded and never stop the batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mop_orchestrator::catalog::{
    Catalog, CatalogResult, CatalogStats, LeaseRecord, MemoryCatalog, SqliteCatalog,
};
use mop_orchestrator::error::{CatalogError, Error, OrchestratorErrorTrait, SelectionError};
use mop_orchestrator::models::{FitOutcome, FitStatus, Target};

use super::fixtures::{microlensing, orchestrator, ScriptedFitter};

/// Catalog whose connection is gone
struct UnreachableCatalog;

fn refused<T>() -> CatalogResult<T> {
    Err(CatalogError::Connection("connection refused".to_string()))
}

#[async_trait]
impl Catalog for UnreachableCatalog {
    async fn list_targets(&self) -> CatalogResult<Vec<Target>> {
        refused()
    }
    async fn get_target(&self, _name: &str) -> CatalogResult<Option<Target>> {
        refused()
    }
    async fn upsert_target(&self, _target: &Target) -> CatalogResult<()> {
        refused()
    }
    async fn claim(
        &self,
        _names: &[String],
        _holder: &str,
        _ttl: Duration,
    ) -> CatalogResult<Vec<Target>> {
        refused()
    }
    async fn renew(&self, _holder: &str, _ttl: Duration) -> CatalogResult<usize> {
        refused()
    }
    async fn release(&self, _holder: &str) -> CatalogResult<usize> {
        refused()
    }
    async fn record_outcome(
        &self,
        _name: &str,
        _outcome: &FitOutcome,
        _recorded_at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        refused()
    }
    async fn active_leases(&self) -> CatalogResult<Vec<LeaseRecord>> {
        refused()
    }
    async fn stats(&self) -> CatalogResult<CatalogStats> {
        refused()
    }
}

#[tokio::test]
async fn test_unreachable_catalog_aborts_batch() {
    let fitter = Arc::new(ScriptedFitter::new());
    let orch = orchestrator(Arc::new(UnreachableCatalog), "inst-1", fitter.clone(), 2);

    let err = orch.run("all").await.unwrap_err();

    assert!(matches!(err, Error::Catalog(CatalogError::Connection(_))));
    assert!(err.is_batch_fatal());
    assert!(fitter.calls().is_empty());
}

#[tokio::test]
async fn test_malformed_selection_aborts_before_touching_catalog() {
    let orch = orchestrator(
        Arc::new(UnreachableCatalog),
        "inst-1",
        Arc::new(ScriptedFitter::new()),
        1,
    );

    for mode in ["recent", "[]", "2023", "[ , ]"] {
        let err = orch.run(mode).await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Selection(
                    SelectionError::InvalidSelectionMode(_) | SelectionError::EmptyYearList(_)
                )
            ),
            "{mode}: {err}"
        );
    }
}

#[test]
fn test_sqlite_path_under_a_file_fails_to_open() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let result = SqliteCatalog::open(file.path().join("catalog.db"), Duration::from_secs(1));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_panicking_fitter_is_contained() {
    let catalog = Arc::new(MemoryCatalog::with_targets([
        microlensing("EV-A"),
        microlensing("EV-B"),
        microlensing("EV-C"),
    ]));
    let fitter = Arc::new(ScriptedFitter::panicking(&["EV-B"]));
    let orch = orchestrator(catalog.clone(), "inst-1", fitter, 3);

    let summary = orch.run("all").await.unwrap();

    assert_eq!(summary.fitted, 2);
    assert_eq!(summary.failed, 1);
    let panicked = catalog.get_target("EV-B").await.unwrap().unwrap();
    assert_eq!(panicked.extras.last_fit_status, Some(FitStatus::Failed));
    assert!(panicked
        .extras
        .last_fit_error
        .unwrap()
        .contains("scripted panic for EV-B"));
}

#[tokio::test]
async fn test_write_failures_are_counted_not_fatal() {
    let catalog = Arc::new(MemoryCatalog::with_targets([
        microlensing("EV-A"),
        microlensing("EV-B"),
    ]));
    // One failure is absorbed by the retry, three are not
    catalog.fail_writes("EV-A", 1);
    catalog.fail_writes("EV-B", 3);

    let orch = orchestrator(catalog.clone(), "inst-1", Arc::new(ScriptedFitter::new()), 2);
    let summary = orch.run("all").await.unwrap();

    assert_eq!(summary.fitted, 2);
    assert_eq!(summary.unrecorded, 1);
    let recorded = catalog.get_target("EV-A").await.unwrap().unwrap();
    assert_eq!(recorded.extras.last_fit_status, Some(FitStatus::Fitted));
    let lost = catalog.get_target("EV-B").await.unwrap().unwrap();
    assert!(lost.extras.last_fit_status.is_none());
    assert!(catalog.active_leases().await.unwrap().is_empty());
}
