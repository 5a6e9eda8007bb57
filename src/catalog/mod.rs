//! Shared target catalog
//!
//! Every component receives an explicit `Arc<dyn Catalog>` handle; there is
//! no process-wide store. Backends:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Selector / LockCoordinator / ResultRecorder          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Catalog trait                         │
//! └─────────────────────────────────────────────────────────────┘
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │     SQLite      │ │   PostgreSQL    │ │     Memory      │
//! │  lease columns  │ │ SKIP LOCKED +   │ │   (testing)     │
//! │ BEGIN IMMEDIATE │ │  lease columns  │ │                 │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```
//!
//! A claim is a lease stored on the target row: `lease_holder` plus
//! `lease_expires_at`. A row whose lease belongs to someone else and has not
//! expired is skipped, never waited on.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{CatalogBackend, CatalogConfig};
use crate::models::{FitOutcome, Target};
use crate::utils::error::CatalogError;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;
pub use sqlite::SqliteCatalog;

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// A live lease on one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRecord {
    pub target: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

/// Catalog-wide counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub alive: usize,
    pub leased: usize,
    pub fitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Shared store of targets
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Every target, in name order
    async fn list_targets(&self) -> CatalogResult<Vec<Target>>;

    /// One target by name
    async fn get_target(&self, name: &str) -> CatalogResult<Option<Target>>;

    /// Insert a target or overwrite its position and attributes
    async fn upsert_target(&self, target: &Target) -> CatalogResult<()>;

    /// Take a lease on every named target that is free, in one transaction.
    ///
    /// Free means: no holder, held by `holder` already, or lease expired.
    /// Targets held by anyone else are left out of the result. Returns the
    /// claimed targets as read inside the claim transaction.
    async fn claim(
        &self,
        names: &[String],
        holder: &str,
        ttl: Duration,
    ) -> CatalogResult<Vec<Target>>;

    /// Push the expiry of every lease held by `holder`; returns the count renewed
    async fn renew(&self, holder: &str, ttl: Duration) -> CatalogResult<usize>;

    /// Drop every lease held by `holder`; returns the count released
    async fn release(&self, holder: &str) -> CatalogResult<usize>;

    /// Atomically apply one target's outcome to its attributes
    async fn record_outcome(
        &self,
        name: &str,
        outcome: &FitOutcome,
        recorded_at: DateTime<Utc>,
    ) -> CatalogResult<()>;

    /// Unexpired leases
    async fn active_leases(&self) -> CatalogResult<Vec<LeaseRecord>>;

    /// Catalog-wide counts
    async fn stats(&self) -> CatalogResult<CatalogStats>;
}

/// Open the configured catalog backend.
///
/// Failing here is a connectivity failure and aborts the batch.
pub async fn open(config: &CatalogConfig) -> CatalogResult<Arc<dyn Catalog>> {
    match config.backend {
        CatalogBackend::Sqlite => {
            let catalog = SqliteCatalog::open(
                &config.sqlite_path,
                Duration::from_millis(config.busy_timeout_ms),
            )?;
            Ok(Arc::new(catalog))
        }
        CatalogBackend::Postgres => {
            let catalog = PgCatalog::connect(&config.postgres_url, config.pool_size).await?;
            Ok(Arc::new(catalog))
        }
    }
}

/// Lease expiry for a claim or renewal made at `now`
pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
