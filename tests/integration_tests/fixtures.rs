//! Test fixtures for integration tests
//!
//! Provides catalog builders, scripted fitters and orchestrator wiring

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use mop_orchestrator::catalog::Catalog;
use mop_orchestrator::dispatcher::{Dispatcher, DispatcherConfig};
use mop_orchestrator::error::FitError;
use mop_orchestrator::fit::FitExecutor;
use mop_orchestrator::lease::LockCoordinator;
use mop_orchestrator::models::{FitParameters, SkyPosition, Target};
use mop_orchestrator::orchestrator::Orchestrator;
use mop_orchestrator::recorder::ResultRecorder;
use mop_orchestrator::selector::Selector;

/// Target classified as a microlensing event and flagged alive
pub fn microlensing(name: &str) -> Target {
    Target::new(name, SkyPosition::new(268.5, -29.1))
        .with_classification("Microlensing")
        .with_alive(true)
}

/// Names of a target list, sorted
pub fn sorted_names(targets: &[String]) -> Vec<String> {
    let mut names = targets.to_vec();
    names.sort();
    names
}

/// Fitter that records every call, fails listed targets and can be held
/// at a gate until the test opens it
pub struct ScriptedFitter {
    calls: Mutex<Vec<String>>,
    fail: HashSet<String>,
    panic_on: HashSet<String>,
    gate: Option<watch::Receiver<bool>>,
}

impl ScriptedFitter {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: HashSet::new(),
            panic_on: HashSet::new(),
            gate: None,
        }
    }

    pub fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|n| n.to_string()).collect(),
            ..Self::new()
        }
    }

    pub fn panicking(names: &[&str]) -> Self {
        Self {
            panic_on: names.iter().map(|n| n.to_string()).collect(),
            ..Self::new()
        }
    }

    /// Fitter that waits until the returned sender publishes `true`
    pub fn gated() -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                gate: Some(rx),
                ..Self::new()
            },
            tx,
        )
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FitExecutor for ScriptedFitter {
    async fn fit(&self, target: &Target, _cores: usize) -> Result<FitParameters, FitError> {
        self.calls.lock().unwrap().push(target.name.clone());

        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        if self.panic_on.contains(&target.name) {
            panic!("scripted panic for {}", target.name);
        }
        if self.fail.contains(&target.name) {
            return Err(FitError::BadData("fewer than 10 points".to_string()));
        }

        Ok(FitParameters {
            t0: 2460200.5,
            u0: 0.12,
            te: 33.0,
            chi2: Some(512.0),
            ..Default::default()
        })
    }
}

/// Orchestrator with a fixed holder id over any catalog
pub fn orchestrator(
    catalog: Arc<dyn Catalog>,
    holder: &str,
    executor: Arc<dyn FitExecutor>,
    workers: usize,
) -> Orchestrator {
    let recorder = ResultRecorder::with_retry(catalog.clone(), 1, Duration::from_millis(10));
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            workers,
            cores_per_fit: 1,
            fit_timeout: Duration::from_secs(30),
            recalibrate_prefixes: vec!["Gaia".to_string()],
        },
        executor,
        recorder,
    );

    Orchestrator::new(
        catalog.clone(),
        Selector::default(),
        LockCoordinator::with_holder(catalog, holder, Duration::from_secs(60)),
        dispatcher,
    )
}

/// Wait until the catalog shows at least one live lease
pub async fn wait_for_lease(catalog: &dyn Catalog) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !catalog.active_leases().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no lease appeared");
}
