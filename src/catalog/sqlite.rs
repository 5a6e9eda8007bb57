//! SQLite catalog backend
//!
//! One database file can be shared by several orchestrator processes. SQLite
//! has no row locks, so a claim is a single `BEGIN IMMEDIATE` transaction that
//! stamps a lease on each free row; rows leased to another holder are skipped.
//! Writers serialize on the database lock only for the few milliseconds a
//! claim or outcome write takes, bounded by the busy timeout.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{lease_expiry, Catalog, CatalogResult, CatalogStats, LeaseRecord};
use crate::models::{FitOutcome, FitParameters, FitStatus, SkyPosition, Target, TargetExtras};
use crate::utils::error::CatalogError;

const TARGET_COLUMNS: &str = "name, ra, dec, classification, alive, last_fit, \
     latest_data_jd, latest_data_utc, fit_params, last_fit_status, last_fit_error";

/// SQLite implementation of [`Catalog`]
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open (and create if needed) a catalog file
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> CatalogResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CatalogError::Connection(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // Enable WAL mode so readers never block the claiming writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite catalog opened");
        Ok(catalog)
    }

    /// Create in-memory catalog (for testing)
    pub fn in_memory() -> CatalogResult<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.create_schema()?;
        Ok(catalog)
    }

    fn conn(&self) -> CatalogResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::Connection("catalog connection mutex poisoned".into()))
    }

    fn create_schema(&self) -> CatalogResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS targets (
                    name TEXT PRIMARY KEY,
                    ra REAL NOT NULL,
                    dec REAL NOT NULL,
                    classification TEXT,
                    alive INTEGER,
                    last_fit TEXT,
                    latest_data_jd REAL,
                    latest_data_utc TEXT,
                    fit_params TEXT,
                    last_fit_status TEXT,
                    last_fit_error TEXT,
                    lease_holder TEXT,
                    lease_expires_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_targets_lease_holder
                    ON targets(lease_holder);
                "#,
        )?;
        Ok(())
    }

    fn list_targets_sync(&self) -> CatalogResult<Vec<Target>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets ORDER BY name"
        ))?;
        let targets = stmt
            .query_map([], row_to_target)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(targets)
    }

    fn get_target_sync(&self, name: &str) -> CatalogResult<Option<Target>> {
        let conn = self.conn()?;
        let target = conn
            .query_row(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE name = ?1"),
                params![name],
                row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    fn upsert_target_sync(&self, target: &Target) -> CatalogResult<()> {
        let conn = self.conn()?;
        let extras = &target.extras;
        let fit_params = encode_fit(&target.name, extras.fit.as_ref())?;

        conn.execute(
            r#"
                INSERT INTO targets (name, ra, dec, classification, alive, last_fit,
                    latest_data_jd, latest_data_utc, fit_params, last_fit_status, last_fit_error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(name) DO UPDATE SET
                    ra = excluded.ra,
                    dec = excluded.dec,
                    classification = excluded.classification,
                    alive = excluded.alive,
                    last_fit = excluded.last_fit,
                    latest_data_jd = excluded.latest_data_jd,
                    latest_data_utc = excluded.latest_data_utc,
                    fit_params = excluded.fit_params,
                    last_fit_status = excluded.last_fit_status,
                    last_fit_error = excluded.last_fit_error
                "#,
            params![
                target.name,
                target.position.ra,
                target.position.dec,
                extras.classification,
                extras.alive,
                extras.last_fit.map(|t| t.to_rfc3339()),
                extras.latest_data_jd,
                extras.latest_data_utc.map(|t| t.to_rfc3339()),
                fit_params,
                extras.last_fit_status.map(|s| s.as_str()),
                extras.last_fit_error,
            ],
        )?;
        Ok(())
    }

    fn claim_sync(
        &self,
        names: &[String],
        holder: &str,
        ttl: Duration,
    ) -> CatalogResult<Vec<Target>> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let expires_ms = lease_expiry(now, ttl).timestamp_millis();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut claimed = Vec::new();
        {
            let mut take = tx.prepare_cached(
                "UPDATE targets SET lease_holder = ?1, lease_expires_at = ?2
                 WHERE name = ?3
                   AND (lease_holder IS NULL
                        OR lease_holder = ?1
                        OR lease_expires_at IS NULL
                        OR lease_expires_at <= ?4)",
            )?;
            let mut read = tx.prepare_cached(&format!(
                "SELECT {TARGET_COLUMNS} FROM targets WHERE name = ?1"
            ))?;

            let mut seen = HashSet::new();
            for name in names {
                if !seen.insert(name.as_str()) {
                    continue;
                }
                if take.execute(params![holder, expires_ms, name, now_ms])? == 1 {
                    claimed.push(read.query_row(params![name], row_to_target)?);
                }
            }
        }
        tx.commit()?;

        Ok(claimed)
    }

    fn renew_sync(&self, holder: &str, ttl: Duration) -> CatalogResult<usize> {
        let expires_ms = lease_expiry(Utc::now(), ttl).timestamp_millis();
        let conn = self.conn()?;
        let renewed = conn.execute(
            "UPDATE targets SET lease_expires_at = ?1 WHERE lease_holder = ?2",
            params![expires_ms, holder],
        )?;
        Ok(renewed)
    }

    fn release_sync(&self, holder: &str) -> CatalogResult<usize> {
        let conn = self.conn()?;
        let released = conn.execute(
            "UPDATE targets SET lease_holder = NULL, lease_expires_at = NULL
             WHERE lease_holder = ?1",
            params![holder],
        )?;
        Ok(released)
    }

    fn record_outcome_sync(
        &self,
        name: &str,
        outcome: &FitOutcome,
        recorded_at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE name = ?1"),
                params![name],
                row_to_target,
            )
            .optional()?
            .ok_or_else(|| CatalogError::TargetNotFound(name.to_string()))?;

        let mut extras = current.extras;
        outcome.apply_to(&mut extras, recorded_at);
        let fit_params = encode_fit(name, extras.fit.as_ref())?;

        tx.execute(
            "UPDATE targets SET alive = ?1, last_fit = ?2, fit_params = ?3,
                 last_fit_status = ?4, last_fit_error = ?5
             WHERE name = ?6",
            params![
                extras.alive,
                extras.last_fit.map(|t| t.to_rfc3339()),
                fit_params,
                extras.last_fit_status.map(|s| s.as_str()),
                extras.last_fit_error,
                name,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn active_leases_sync(&self) -> CatalogResult<Vec<LeaseRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, lease_holder, lease_expires_at FROM targets
             WHERE lease_holder IS NOT NULL AND lease_expires_at > ?1
             ORDER BY name",
        )?;
        let leases = stmt
            .query_map(params![Utc::now().timestamp_millis()], |row| {
                let expires_ms: i64 = row.get(2)?;
                Ok(LeaseRecord {
                    target: row.get(0)?,
                    holder: row.get(1)?,
                    expires_at: DateTime::from_timestamp_millis(expires_ms)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(leases)
    }

    fn stats_sync(&self) -> CatalogResult<CatalogStats> {
        let conn = self.conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(alive = 1), 0),
                    COALESCE(SUM(lease_holder IS NOT NULL AND lease_expires_at > ?1), 0),
                    COALESCE(SUM(last_fit_status = 'fitted'), 0),
                    COALESCE(SUM(last_fit_status = 'skipped'), 0),
                    COALESCE(SUM(last_fit_status = 'failed'), 0)
             FROM targets",
            params![Utc::now().timestamp_millis()],
            |row| {
                Ok(CatalogStats {
                    total: row.get::<_, i64>(0)? as usize,
                    alive: row.get::<_, i64>(1)? as usize,
                    leased: row.get::<_, i64>(2)? as usize,
                    fitted: row.get::<_, i64>(3)? as usize,
                    skipped: row.get::<_, i64>(4)? as usize,
                    failed: row.get::<_, i64>(5)? as usize,
                })
            },
        )?;
        Ok(stats)
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn list_targets(&self) -> CatalogResult<Vec<Target>> {
        self.list_targets_sync()
    }

    async fn get_target(&self, name: &str) -> CatalogResult<Option<Target>> {
        self.get_target_sync(name)
    }

    async fn upsert_target(&self, target: &Target) -> CatalogResult<()> {
        self.upsert_target_sync(target)
    }

    async fn claim(
        &self,
        names: &[String],
        holder: &str,
        ttl: Duration,
    ) -> CatalogResult<Vec<Target>> {
        self.claim_sync(names, holder, ttl)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> CatalogResult<usize> {
        self.renew_sync(holder, ttl)
    }

    async fn release(&self, holder: &str) -> CatalogResult<usize> {
        self.release_sync(holder)
    }

    async fn record_outcome(
        &self,
        name: &str,
        outcome: &FitOutcome,
        recorded_at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        self.record_outcome_sync(name, outcome, recorded_at)
    }

    async fn active_leases(&self) -> CatalogResult<Vec<LeaseRecord>> {
        self.active_leases_sync()
    }

    async fn stats(&self) -> CatalogResult<CatalogStats> {
        self.stats_sync()
    }
}

fn encode_fit(name: &str, fit: Option<&FitParameters>) -> CatalogResult<Option<String>> {
    fit.map(serde_json::to_string)
        .transpose()
        .map_err(|e| CatalogError::CorruptAttribute {
            target: name.to_string(),
            field: "fit_params".into(),
            reason: e.to_string(),
        })
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, e))
        })
        .transpose()
}

fn row_to_target(row: &Row<'_>) -> rusqlite::Result<Target> {
    let fit = row
        .get::<_, Option<String>>(8)?
        .map(|json| serde_json::from_str::<FitParameters>(&json).map_err(|e| conversion_error(8, e)))
        .transpose()?;

    let last_fit_status = row
        .get::<_, Option<String>>(9)?
        .map(|s| s.parse::<FitStatus>().map_err(|e| conversion_error(9, e)))
        .transpose()?;

    Ok(Target {
        name: row.get(0)?,
        position: SkyPosition {
            ra: row.get(1)?,
            dec: row.get(2)?,
        },
        extras: TargetExtras {
            classification: row.get(3)?,
            alive: row.get(4)?,
            last_fit: parse_time(5, row.get(5)?)?,
            latest_data_jd: row.get(6)?,
            latest_data_utc: parse_time(7, row.get(7)?)?,
            fit,
            last_fit_status,
            last_fit_error: row.get(10)?,
        },
    })
}
