// Core data structures for the fit orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::{FitError, SelectionError};

/// Sky position in degrees (ICRS)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra: f64,
    pub dec: f64,
}

impl SkyPosition {
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }
}

/// A tracked candidate event in the shared catalog
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Target {
    /// Unique catalog key (e.g. "Gaia21abc", "OGLE-2023-BLG-0001")
    pub name: String,
    pub position: SkyPosition,
    pub extras: TargetExtras,
}

impl Target {
    pub fn new(name: impl Into<String>, position: SkyPosition) -> Self {
        Self {
            name: name.into(),
            position,
            extras: TargetExtras::default(),
        }
    }

    /// Builder-style setter for the classification label
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.extras.classification = Some(classification.into());
        self
    }

    /// Builder-style setter for the liveness flag
    pub fn with_alive(mut self, alive: bool) -> Self {
        self.extras.alive = Some(alive);
        self
    }

    /// Builder-style setter for the last-fit timestamp
    pub fn with_last_fit(mut self, at: DateTime<Utc>) -> Self {
        self.extras.last_fit = Some(at);
        self
    }

    /// Whether the classification marks this target as a microlensing event.
    ///
    /// A missing classification does not qualify.
    pub fn is_microlensing(&self) -> bool {
        self.extras
            .classification
            .as_deref()
            .is_some_and(|c| c.contains(MICROLENSING_CLASS))
    }
}

/// Classification substring that routes a target to the numeric fit
pub const MICROLENSING_CLASS: &str = "Microlensing";

/// Derived per-target state written by ingestion and by the orchestrator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetExtras {
    pub classification: Option<String>,
    pub alive: Option<bool>,
    pub last_fit: Option<DateTime<Utc>>,
    /// Julian date of the most recent photometric point
    pub latest_data_jd: Option<f64>,
    pub latest_data_utc: Option<DateTime<Utc>>,
    pub fit: Option<FitParameters>,
    pub last_fit_status: Option<FitStatus>,
    pub last_fit_error: Option<String>,
}

/// Model parameters reported by the external fitter
///
/// Point-source point-lens with optional parallax terms.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitParameters {
    /// Time of peak magnification (JD)
    pub t0: f64,
    /// Impact parameter
    pub u0: f64,
    /// Einstein crossing time (days)
    pub te: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pi_en: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pi_ee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chi2: Option<f64>,
    /// Fitter's verdict on whether the event is still ongoing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
}

/// Persisted status of the last attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitStatus {
    Fitted,
    Skipped,
    Failed,
}

impl FitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fitted => "fitted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for FitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fitted" => Ok(Self::Fitted),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown fit status '{other}'")),
        }
    }
}

/// Result of processing one claimed target
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    Fitted(FitParameters),
    Skipped(String),
    Failed(FitError),
}

impl FitOutcome {
    pub fn status(&self) -> FitStatus {
        match self {
            Self::Fitted(_) => FitStatus::Fitted,
            Self::Skipped(_) => FitStatus::Skipped,
            Self::Failed(_) => FitStatus::Failed,
        }
    }

    /// Apply this outcome to a target's attributes as of `recorded_at`.
    ///
    /// Pure function of its inputs, so recording the same outcome twice
    /// converges on the same attributes.
    pub fn apply_to(&self, extras: &mut TargetExtras, recorded_at: DateTime<Utc>) {
        extras.last_fit_status = Some(self.status());
        match self {
            Self::Fitted(params) => {
                extras.last_fit = Some(recorded_at);
                extras.last_fit_error = None;
                if let Some(alive) = params.alive {
                    extras.alive = Some(alive);
                }
                extras.fit = Some(params.clone());
            }
            Self::Skipped(_) => {
                extras.alive = Some(false);
                extras.last_fit_error = None;
            }
            Self::Failed(err) => {
                extras.last_fit_error = Some(err.to_string());
            }
        }
    }
}

/// How to pick candidate targets from the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    /// Every target
    All,
    /// Targets flagged alive
    Alive,
    /// Targets with a last fit inside the refit window
    NeedsRefit,
    /// Targets whose name contains any of the year tokens
    YearSet(Vec<String>),
}

impl FromStr for SelectionMode {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "all" => return Ok(Self::All),
            "alive" => return Ok(Self::Alive),
            "need" => return Ok(Self::NeedsRefit),
            _ => {}
        }

        let inner = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| SelectionError::InvalidSelectionMode(s.to_string()))?;

        let years: Vec<String> = inner
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(String::from)
            .collect();

        if years.is_empty() {
            return Err(SelectionError::EmptyYearList(s.to_string()));
        }

        Ok(Self::YearSet(years))
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Alive => write!(f, "alive"),
            Self::NeedsRefit => write!(f, "need"),
            Self::YearSet(years) => write!(f, "[{}]", years.join(",")),
        }
    }
}

/// End-of-batch counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Candidates produced by the selector
    pub selected: usize,
    /// Candidates this instance holds a lease on
    pub claimed: usize,
    /// Candidates held by another instance
    pub excluded: usize,
    pub fitted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Outcomes that could not be persisted
    pub unrecorded: usize,
    pub failed_targets: Vec<String>,
}

impl BatchSummary {
    /// Number of targets with a terminal outcome
    pub fn processed(&self) -> usize {
        self.fitted + self.skipped + self.failed
    }

    /// Success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.processed();
        if total == 0 {
            return 1.0;
        }
        self.fitted as f64 / total as f64
    }
}
