//! Multi-instance claim tests
//!
//! Two orchestrators with distinct holder ids share one catalog and select
//! overlapping candidate sets. While the first holds its lease, the second
//! must leave every held target alone, whichever mode the first one ran.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use mop_orchestrator::catalog::{Catalog, MemoryCatalog, SqliteCatalog};
use mop_orchestrator::models::FitStatus;

use super::fixtures::{microlensing, orchestrator, sorted_names, wait_for_lease, ScriptedFitter};

const NAMES: [&str; 6] = [
    "KMT-2023-BLG-0101",
    "KMT-2023-BLG-0102",
    "OGLE-2023-BLG-0440",
    "OGLE-2024-BLG-0007",
    "MOA-2024-BLG-0150",
    "Gaia24abc",
];

/// Modes under which the first instance picks exactly the 2023 events
const FIRST_MODES: [&str; 3] = ["[2023]", "alive", "need"];

/// The 2023 events are alive and were fit an hour ago; the rest are neither
async fn seed(catalog: &dyn Catalog) {
    let recent = Utc::now() - chrono::Duration::hours(1);
    for name in NAMES {
        let target = if name.contains("2023") {
            microlensing(name).with_last_fit(recent)
        } else {
            microlensing(name).with_alive(false)
        };
        catalog.upsert_target(&target).await.unwrap();
    }
}

/// First instance runs `first_mode` and holds its claim; second runs `all`
/// meanwhile
async fn assert_disjoint_batches(
    first_mode: &str,
    first_catalog: Arc<dyn Catalog>,
    second_catalog: Arc<dyn Catalog>,
) {
    let (gated, gate) = ScriptedFitter::gated();
    let first_fitter = Arc::new(gated);
    let second_fitter = Arc::new(ScriptedFitter::new());

    let first = orchestrator(first_catalog.clone(), "inst-1", first_fitter.clone(), 2);
    let second = orchestrator(second_catalog.clone(), "inst-2", second_fitter.clone(), 2);

    let mode = first_mode.to_string();
    let first_run = tokio::spawn(async move { first.run(&mode).await });
    wait_for_lease(second_catalog.as_ref()).await;

    let second_summary = second.run("all").await.unwrap();

    gate.send(true).unwrap();
    let first_summary = first_run.await.unwrap().unwrap();

    let first_fitted: HashSet<String> = first_fitter.calls().into_iter().collect();
    let second_fitted: HashSet<String> = second_fitter.calls().into_iter().collect();

    assert!(
        first_fitted.is_disjoint(&second_fitted),
        "{first_mode} overlap: {:?}",
        first_fitted.intersection(&second_fitted).collect::<Vec<_>>()
    );
    assert_eq!(
        sorted_names(&first_fitted.into_iter().collect::<Vec<_>>()),
        vec!["KMT-2023-BLG-0101", "KMT-2023-BLG-0102", "OGLE-2023-BLG-0440"],
        "{first_mode}"
    );
    assert_eq!(second_fitted.len(), 3);

    assert_eq!(first_summary.claimed, 3);
    assert_eq!(first_summary.fitted, 3);
    assert_eq!(second_summary.selected, 6);
    assert_eq!(second_summary.claimed, 3);
    assert_eq!(second_summary.excluded, 3);

    for name in NAMES {
        let target = second_catalog.get_target(name).await.unwrap().unwrap();
        assert_eq!(target.extras.last_fit_status, Some(FitStatus::Fitted), "{name}");
    }
    assert!(second_catalog.active_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_two_instances_claim_disjoint_sets_in_memory() {
    for mode in FIRST_MODES {
        let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
        seed(catalog.as_ref()).await;

        assert_disjoint_batches(mode, catalog.clone(), catalog).await;
    }
}

#[tokio::test]
async fn test_two_instances_claim_disjoint_sets_in_sqlite() {
    for mode in FIRST_MODES {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");

        // Separate connections stand in for separate processes
        let first: Arc<dyn Catalog> =
            Arc::new(SqliteCatalog::open(&path, Duration::from_secs(5)).unwrap());
        let second: Arc<dyn Catalog> =
            Arc::new(SqliteCatalog::open(&path, Duration::from_secs(5)).unwrap());
        seed(first.as_ref()).await;

        assert_disjoint_batches(mode, first, second).await;
    }
}

#[tokio::test]
async fn test_released_targets_are_claimable_by_next_instance() {
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
    seed(catalog.as_ref()).await;

    let first = orchestrator(catalog.clone(), "inst-1", Arc::new(ScriptedFitter::new()), 2);
    let second = orchestrator(catalog.clone(), "inst-2", Arc::new(ScriptedFitter::new()), 2);

    let a = first.run("all").await.unwrap();
    let b = second.run("all").await.unwrap();

    assert_eq!(a.claimed, 6);
    assert_eq!(b.claimed, 6);
    assert_eq!(b.excluded, 0);
}

#[tokio::test]
async fn test_expired_lease_from_crashed_instance_is_reclaimed() {
    let memory = Arc::new(MemoryCatalog::new());
    seed(memory.as_ref()).await;
    // A crashed instance left a lease that has already run out
    memory.hold("Gaia24abc", "crashed", Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let catalog: Arc<dyn Catalog> = memory.clone();
    let orch = orchestrator(catalog, "inst-1", Arc::new(ScriptedFitter::new()), 1);
    let summary = orch.run("all").await.unwrap();

    assert_eq!(summary.claimed, 6);
    assert_eq!(summary.excluded, 0);
}
