//! End-to-end batch tests
//!
//! Full select → claim → fit → record runs against a SQLite catalog on disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use mop_orchestrator::catalog::{Catalog, SqliteCatalog};
use mop_orchestrator::models::{FitStatus, SelectionMode, SkyPosition, Target};

use super::fixtures::{microlensing, orchestrator, ScriptedFitter};

fn sqlite_catalog(dir: &tempfile::TempDir) -> Arc<SqliteCatalog> {
    Arc::new(SqliteCatalog::open(dir.path().join("catalog.db"), Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_failing_target_does_not_block_the_rest() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = sqlite_catalog(&dir);
    let names = ["EV-1", "EV-2", "EV-3", "EV-4", "EV-5"];
    for name in names {
        catalog.upsert_target(&microlensing(name)).await.unwrap();
    }

    let fitter = Arc::new(ScriptedFitter::failing(&["EV-3"]));
    let orch = orchestrator(catalog.clone(), "inst-1", fitter.clone(), 2);
    let summary = orch.run("all").await.unwrap();

    assert_eq!(summary.fitted, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_targets, vec!["EV-3".to_string()]);
    assert_eq!(fitter.calls().len(), 5);

    for name in ["EV-1", "EV-2", "EV-4", "EV-5"] {
        let target = catalog.get_target(name).await.unwrap().unwrap();
        assert_eq!(target.extras.last_fit_status, Some(FitStatus::Fitted), "{name}");
        assert_eq!(target.extras.fit.as_ref().map(|p| p.te), Some(33.0));
    }

    let failed = catalog.get_target("EV-3").await.unwrap().unwrap();
    assert_eq!(failed.extras.last_fit_status, Some(FitStatus::Failed));
    assert!(failed
        .extras
        .last_fit_error
        .unwrap()
        .contains("fewer than 10 points"));
    assert!(failed.extras.fit.is_none());
}

#[tokio::test]
async fn test_variable_star_is_skipped_and_marked_dead() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = sqlite_catalog(&dir);
    catalog
        .upsert_target(
            &Target::new("ZTF24aaavar", SkyPosition::new(12.0, 40.0))
                .with_classification("Variable_star")
                .with_alive(true),
        )
        .await
        .unwrap();

    let fitter = Arc::new(ScriptedFitter::new());
    let orch = orchestrator(catalog.clone(), "inst-1", fitter.clone(), 4);
    let summary = orch.run("alive").await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert!(fitter.calls().is_empty());

    let target = catalog.get_target("ZTF24aaavar").await.unwrap().unwrap();
    assert_eq!(target.extras.alive, Some(false));
    assert_eq!(target.extras.last_fit_status, Some(FitStatus::Skipped));

    // No longer alive, so the next alive batch has nothing to do
    let again = orch.run("alive").await.unwrap();
    assert_eq!(again.selected, 0);
}

#[tokio::test]
async fn test_need_mode_uses_refit_window() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = sqlite_catalog(&dir);
    let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();

    catalog
        .upsert_target(&microlensing("RECENT").with_last_fit(now - chrono::Duration::hours(3)))
        .await
        .unwrap();
    catalog
        .upsert_target(&microlensing("STALE").with_last_fit(now - chrono::Duration::hours(5)))
        .await
        .unwrap();
    catalog.upsert_target(&microlensing("NEVER")).await.unwrap();

    let fitter = Arc::new(ScriptedFitter::new());
    let orch = orchestrator(catalog.clone(), "inst-1", fitter.clone(), 1);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let summary = orch
        .run_mode(&SelectionMode::NeedsRefit, now, &mut rng, std::future::pending())
        .await
        .unwrap();

    assert_eq!(summary.selected, 1);
    assert_eq!(fitter.calls(), vec!["RECENT".to_string()]);
}

#[tokio::test]
async fn test_year_mode_selects_matching_names() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = sqlite_catalog(&dir);
    for name in ["ML2022-001", "XY2023-9", "ML2021-001"] {
        catalog.upsert_target(&microlensing(name)).await.unwrap();
    }

    let fitter = Arc::new(ScriptedFitter::new());
    let orch = orchestrator(catalog.clone(), "inst-1", fitter.clone(), 1);
    let summary = orch.run("[2022, 2023]").await.unwrap();

    assert_eq!(summary.selected, 2);
    let mut calls = fitter.calls();
    calls.sort();
    assert_eq!(calls, vec!["ML2022-001", "XY2023-9"]);

    let untouched = catalog.get_target("ML2021-001").await.unwrap().unwrap();
    assert!(untouched.extras.last_fit_status.is_none());
}

#[tokio::test]
async fn test_rerunning_a_batch_converges() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = sqlite_catalog(&dir);
    catalog.upsert_target(&microlensing("EV-9")).await.unwrap();

    let orch = orchestrator(catalog.clone(), "inst-1", Arc::new(ScriptedFitter::new()), 1);
    orch.run("all").await.unwrap();
    let first = catalog.get_target("EV-9").await.unwrap().unwrap();
    orch.run("all").await.unwrap();
    let second = catalog.get_target("EV-9").await.unwrap().unwrap();

    assert_eq!(first.extras.fit, second.extras.fit);
    assert_eq!(first.extras.last_fit_status, second.extras.last_fit_status);
    assert!(second.extras.last_fit >= first.extras.last_fit);
}
