//! Alert ingestion collaborators
//!
//! Targets enter the catalog from alert brokers. An [`AlertBroker`] finds and
//! fetches alerts; a [`NameBroker`] resolves a name or a sky position to a
//! classification label. [`ingest_alert`] turns one alert into a catalog
//! upsert, and [`harvest_region`] chains search, fetch, classify and ingest.

pub mod tns;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::models::{SkyPosition, Target};
use crate::utils::error::BrokerError;
use crate::utils::from_julian_date;

pub use tns::{TnsClient, TnsConfig};

/// One photometric measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photometry {
    /// Julian date of the measurement
    pub jd: f64,
    /// Magnitude; `None` for untrusted or null points
    pub mag: Option<f64>,
    pub err: Option<f64>,
}

/// An alert as published by a broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub name: String,
    pub position: SkyPosition,
    pub classification: Option<String>,
    #[serde(default)]
    pub timeseries: Vec<Photometry>,
}

impl Alert {
    /// Julian date of the latest usable measurement
    pub fn latest_jd(&self) -> Option<f64> {
        self.timeseries
            .iter()
            .filter(|p| p.mag.is_some() && p.jd.is_finite())
            .map(|p| p.jd)
            .reduce(f64::max)
    }
}

/// Source of alerts
#[async_trait]
pub trait AlertBroker: Send + Sync {
    /// Identifiers of alerts within `radius_arcsec` of `position`
    async fn search(
        &self,
        position: SkyPosition,
        radius_arcsec: f64,
    ) -> std::result::Result<Vec<String>, BrokerError>;

    /// Full alert, time series included
    async fn fetch(&self, id: &str) -> std::result::Result<Alert, BrokerError>;
}

/// What to resolve against a naming service
#[derive(Debug, Clone, PartialEq)]
pub enum NameQuery {
    Name(String),
    Position {
        position: SkyPosition,
        radius_arcsec: f64,
    },
}

/// Resolves a name or position to a classification label
#[async_trait]
pub trait NameBroker: Send + Sync {
    async fn lookup(&self, query: &NameQuery) -> std::result::Result<String, BrokerError>;
}

/// Upsert the alert's target with its latest-data timestamps.
///
/// Existing attributes are kept; the alert's classification replaces the
/// stored one only when the alert carries one.
pub async fn ingest_alert(catalog: &dyn Catalog, alert: &Alert) -> Result<Target> {
    let mut target = catalog
        .get_target(&alert.name)
        .await?
        .unwrap_or_else(|| Target::new(alert.name.clone(), alert.position));

    target.position = alert.position;
    if let Some(classification) = &alert.classification {
        target.extras.classification = Some(classification.clone());
    }
    if let Some(jd) = alert.latest_jd() {
        target.extras.latest_data_jd = Some(jd);
        target.extras.latest_data_utc = from_julian_date(jd);
    }

    catalog.upsert_target(&target).await?;
    debug!(target = %target.name, latest_jd = ?target.extras.latest_data_jd, "Alert ingested");
    Ok(target)
}

/// Ingest every alert a broker reports around `position`.
///
/// Alerts without a classification are resolved through `names` when given.
/// A failure on one alert is logged and does not stop the others; catalog
/// failures abort.
pub async fn harvest_region(
    catalog: &dyn Catalog,
    alerts: &dyn AlertBroker,
    names: Option<&dyn NameBroker>,
    position: SkyPosition,
    radius_arcsec: f64,
) -> Result<Vec<Target>> {
    let ids = alerts.search(position, radius_arcsec).await?;
    info!(
        ra = position.ra,
        dec = position.dec,
        radius_arcsec,
        found = ids.len(),
        "Harvesting alerts"
    );

    let mut ingested = Vec::with_capacity(ids.len());
    for id in ids {
        let mut alert = match alerts.fetch(&id).await {
            Ok(alert) => alert,
            Err(e) => {
                warn!(alert = %id, error = %e, "Failed to fetch alert");
                continue;
            }
        };

        if alert.classification.is_none() {
            if let Some(names) = names {
                match names.lookup(&NameQuery::Name(alert.name.clone())).await {
                    Ok(class) => alert.classification = Some(class),
                    Err(e) => debug!(alert = %alert.name, error = %e, "No classification found"),
                }
            }
        }

        ingested.push(ingest_alert(catalog, &alert).await?);
    }

    Ok(ingested)
}
