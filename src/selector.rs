//! Candidate selection
//!
//! Turns a [`SelectionMode`] into the list of target names to try to claim.
//! Selection only reads the catalog; exclusivity is the lock coordinator's job.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::models::{SelectionMode, Target};

/// Default `need` window
pub const DEFAULT_REFIT_WINDOW_HOURS: i64 = 4;

/// Selects candidate targets for one batch
#[derive(Debug, Clone)]
pub struct Selector {
    /// `None` when the window is wider than chrono can represent
    refit_window: Option<Duration>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(DEFAULT_REFIT_WINDOW_HOURS)
    }
}

impl Selector {
    pub fn new(refit_window_hours: i64) -> Self {
        Self {
            refit_window: Duration::try_hours(refit_window_hours),
        }
    }

    /// Parse `mode` and select from the catalog as of now
    pub async fn select_str(&self, catalog: &dyn Catalog, mode: &str) -> Result<Vec<Target>> {
        let mode: SelectionMode = mode.parse()?;
        let mut rng = StdRng::from_entropy();
        self.select(catalog, &mode, Utc::now(), &mut rng).await
    }

    /// Select candidates for `mode` as of `now`.
    ///
    /// Year sets come back shuffled with `rng`; other modes keep catalog order.
    pub async fn select<R: Rng + ?Sized>(
        &self,
        catalog: &dyn Catalog,
        mode: &SelectionMode,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<Vec<Target>> {
        let targets = catalog.list_targets().await?;
        let total = targets.len();
        let selected = self.filter(targets, mode, now, rng);

        tracing::info!(mode = %mode, total, selected = selected.len(), "Selected candidate targets");
        Ok(selected)
    }

    /// Apply `mode` to an already-loaded target list
    pub fn filter<R: Rng + ?Sized>(
        &self,
        targets: Vec<Target>,
        mode: &SelectionMode,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Vec<Target> {
        match mode {
            SelectionMode::All => targets,
            SelectionMode::Alive => targets
                .into_iter()
                .filter(|t| t.extras.alive == Some(true))
                .collect(),
            SelectionMode::NeedsRefit => {
                // A cutoff before the representable range admits every fit
                let cutoff = self
                    .refit_window
                    .and_then(|window| now.checked_sub_signed(window));
                targets
                    .into_iter()
                    .filter(|t| {
                        t.extras
                            .last_fit
                            .is_some_and(|at| cutoff.map_or(true, |cutoff| at > cutoff))
                    })
                    .collect()
            }
            SelectionMode::YearSet(years) => {
                let mut matching: Vec<Target> = targets
                    .into_iter()
                    .filter(|t| years.iter().any(|y| t.name.contains(y.as_str())))
                    .collect();
                matching.shuffle(rng);
                matching
            }
        }
    }
}
