//! In-memory catalog
//!
//! Useful for testing without database dependencies. Several orchestrators
//! sharing one `Arc<MemoryCatalog>` behave like processes sharing a database:
//! leases are honored the same way. Write failures can be injected per target.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{lease_expiry, Catalog, CatalogResult, CatalogStats, LeaseRecord};
use crate::models::{FitOutcome, FitStatus, Target};
use crate::utils::error::CatalogError;

#[derive(Debug, Clone)]
struct Row {
    target: Target,
    lease: Option<(String, DateTime<Utc>)>,
}

impl Row {
    fn is_free_for(&self, holder: &str, now: DateTime<Utc>) -> bool {
        match &self.lease {
            None => true,
            Some((owner, expires_at)) => owner == holder || *expires_at <= now,
        }
    }
}

/// In-memory implementation of [`Catalog`]
#[derive(Default)]
pub struct MemoryCatalog {
    rows: RwLock<BTreeMap<String, Row>>,
    /// Remaining injected write failures per target
    write_faults: RwLock<HashMap<String, u32>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog pre-populated with `targets`
    pub fn with_targets(targets: impl IntoIterator<Item = Target>) -> Self {
        let catalog = Self::new();
        if let Ok(mut rows) = catalog.rows.write() {
            for target in targets {
                rows.insert(target.name.clone(), Row { target, lease: None });
            }
        }
        catalog
    }

    /// Make the next `times` outcome writes for `name` fail
    pub fn fail_writes(&self, name: &str, times: u32) {
        if let Ok(mut faults) = self.write_faults.write() {
            faults.insert(name.to_string(), times);
        }
    }

    /// Hold a lease on behalf of another holder, as a concurrent instance would
    pub fn hold(&self, name: &str, holder: &str, ttl: Duration) {
        if let Ok(mut rows) = self.rows.write() {
            if let Some(row) = rows.get_mut(name) {
                row.lease = Some((holder.to_string(), lease_expiry(Utc::now(), ttl)));
            }
        }
    }

    /// Current holder of a target's lease, expired or not
    pub fn holder_of(&self, name: &str) -> Option<String> {
        self.rows
            .read()
            .ok()?
            .get(name)?
            .lease
            .as_ref()
            .map(|(holder, _)| holder.clone())
    }

    fn read(&self) -> CatalogResult<RwLockReadGuard<'_, BTreeMap<String, Row>>> {
        self.rows
            .read()
            .map_err(|_| CatalogError::Connection("memory catalog lock poisoned".into()))
    }

    fn write(&self) -> CatalogResult<RwLockWriteGuard<'_, BTreeMap<String, Row>>> {
        self.rows
            .write()
            .map_err(|_| CatalogError::Connection("memory catalog lock poisoned".into()))
    }

    fn take_fault(&self, name: &str) -> bool {
        let Ok(mut faults) = self.write_faults.write() else {
            return false;
        };
        match faults.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_targets(&self) -> CatalogResult<Vec<Target>> {
        Ok(self.read()?.values().map(|row| row.target.clone()).collect())
    }

    async fn get_target(&self, name: &str) -> CatalogResult<Option<Target>> {
        Ok(self.read()?.get(name).map(|row| row.target.clone()))
    }

    async fn upsert_target(&self, target: &Target) -> CatalogResult<()> {
        let mut rows = self.write()?;
        match rows.get_mut(&target.name) {
            Some(row) => row.target = target.clone(),
            None => {
                rows.insert(
                    target.name.clone(),
                    Row {
                        target: target.clone(),
                        lease: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn claim(
        &self,
        names: &[String],
        holder: &str,
        ttl: Duration,
    ) -> CatalogResult<Vec<Target>> {
        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl);
        let mut rows = self.write()?;
        let mut seen = HashSet::new();
        let mut claimed = Vec::new();

        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if let Some(row) = rows.get_mut(name) {
                if row.is_free_for(holder, now) {
                    row.lease = Some((holder.to_string(), expires_at));
                    claimed.push(row.target.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> CatalogResult<usize> {
        let expires_at = lease_expiry(Utc::now(), ttl);
        let mut rows = self.write()?;
        let mut renewed = 0;
        for row in rows.values_mut() {
            if let Some((owner, expiry)) = row.lease.as_mut() {
                if owner == holder {
                    *expiry = expires_at;
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn release(&self, holder: &str) -> CatalogResult<usize> {
        let mut rows = self.write()?;
        let mut released = 0;
        for row in rows.values_mut() {
            if row.lease.as_ref().is_some_and(|(owner, _)| owner == holder) {
                row.lease = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn record_outcome(
        &self,
        name: &str,
        outcome: &FitOutcome,
        recorded_at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        if self.take_fault(name) {
            return Err(CatalogError::Connection(format!(
                "injected write failure for {name}"
            )));
        }

        let mut rows = self.write()?;
        let row = rows
            .get_mut(name)
            .ok_or_else(|| CatalogError::TargetNotFound(name.to_string()))?;
        outcome.apply_to(&mut row.target.extras, recorded_at);
        Ok(())
    }

    async fn active_leases(&self) -> CatalogResult<Vec<LeaseRecord>> {
        let now = Utc::now();
        Ok(self
            .read()?
            .values()
            .filter_map(|row| {
                let (holder, expires_at) = row.lease.as_ref()?;
                (*expires_at > now).then(|| LeaseRecord {
                    target: row.target.name.clone(),
                    holder: holder.clone(),
                    expires_at: *expires_at,
                })
            })
            .collect())
    }

    async fn stats(&self) -> CatalogResult<CatalogStats> {
        let now = Utc::now();
        let rows = self.read()?;
        let mut stats = CatalogStats {
            total: rows.len(),
            ..Default::default()
        };

        for row in rows.values() {
            let extras = &row.target.extras;
            if extras.alive == Some(true) {
                stats.alive += 1;
            }
            if row.lease.as_ref().is_some_and(|(_, exp)| *exp > now) {
                stats.leased += 1;
            }
            match extras.last_fit_status {
                Some(FitStatus::Fitted) => stats.fitted += 1,
                Some(FitStatus::Skipped) => stats.skipped += 1,
                Some(FitStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }

        Ok(stats)
    }
}
