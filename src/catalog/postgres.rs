//! PostgreSQL catalog backend
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... RETURNING`
//! statement: rows another transaction is claiming right now are skipped, and
//! rows whose lease belongs to another live holder are filtered out. The lease
//! columns then keep the hold for the rest of the batch without an open
//! transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Config as PgPoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::{NoTls, Row};

use super::{lease_expiry, Catalog, CatalogResult, CatalogStats, LeaseRecord};
use crate::models::{FitOutcome, FitParameters, FitStatus, SkyPosition, Target, TargetExtras};
use crate::utils::error::CatalogError;

const TARGET_COLUMNS: &str = "name, ra, dec, classification, alive, last_fit, \
     latest_data_jd, latest_data_utc, fit_params, last_fit_status, last_fit_error";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS targets (
        name TEXT PRIMARY KEY,
        ra DOUBLE PRECISION NOT NULL,
        dec DOUBLE PRECISION NOT NULL,
        classification TEXT,
        alive BOOLEAN,
        last_fit TIMESTAMPTZ,
        latest_data_jd DOUBLE PRECISION,
        latest_data_utc TIMESTAMPTZ,
        fit_params JSONB,
        last_fit_status TEXT,
        last_fit_error TEXT,
        lease_holder TEXT,
        lease_expires_at TIMESTAMPTZ
    );

    CREATE INDEX IF NOT EXISTS idx_targets_lease_holder ON targets(lease_holder);
"#;

/// PostgreSQL implementation of [`Catalog`]
pub struct PgCatalog {
    pool: Pool,
}

impl PgCatalog {
    /// Create the connection pool, check connectivity and ensure the schema
    pub async fn connect(url: &str, pool_size: usize) -> CatalogResult<Self> {
        let mut cfg = PgPoolConfig::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(pool_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| CatalogError::Connection(format!("PostgreSQL pool: {e}")))?;

        let client = pool.get().await?;
        client.batch_execute(SCHEMA).await?;

        tracing::info!(pool_size, "PostgreSQL catalog connected");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn list_targets(&self) -> CatalogResult<Vec<Target>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM targets ORDER BY name"),
                &[],
            )
            .await?;
        rows.iter().map(row_to_target).collect()
    }

    async fn get_target(&self, name: &str) -> CatalogResult<Option<Target>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE name = $1"),
                &[&name],
            )
            .await?;
        row.as_ref().map(row_to_target).transpose()
    }

    async fn upsert_target(&self, target: &Target) -> CatalogResult<()> {
        let client = self.pool.get().await?;
        let extras = &target.extras;
        let fit_params = encode_fit(&target.name, extras.fit.as_ref())?;
        let status = extras.last_fit_status.map(|s| s.as_str());

        client
            .execute(
                r#"
                INSERT INTO targets (name, ra, dec, classification, alive, last_fit,
                    latest_data_jd, latest_data_utc, fit_params, last_fit_status, last_fit_error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (name) DO UPDATE SET
                    ra = EXCLUDED.ra,
                    dec = EXCLUDED.dec,
                    classification = EXCLUDED.classification,
                    alive = EXCLUDED.alive,
                    last_fit = EXCLUDED.last_fit,
                    latest_data_jd = EXCLUDED.latest_data_jd,
                    latest_data_utc = EXCLUDED.latest_data_utc,
                    fit_params = EXCLUDED.fit_params,
                    last_fit_status = EXCLUDED.last_fit_status,
                    last_fit_error = EXCLUDED.last_fit_error
                "#,
                &[
                    &target.name,
                    &target.position.ra,
                    &target.position.dec,
                    &extras.classification,
                    &extras.alive,
                    &extras.last_fit,
                    &extras.latest_data_jd,
                    &extras.latest_data_utc,
                    &fit_params,
                    &status,
                    &extras.last_fit_error,
                ],
            )
            .await?;
        Ok(())
    }

    async fn claim(
        &self,
        names: &[String],
        holder: &str,
        ttl: Duration,
    ) -> CatalogResult<Vec<Target>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let expires_at = lease_expiry(now, ttl);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "UPDATE targets SET lease_holder = $1, lease_expires_at = $2
                     WHERE name IN (
                         SELECT name FROM targets
                         WHERE name = ANY($3)
                           AND (lease_holder IS NULL
                                OR lease_holder = $1
                                OR lease_expires_at IS NULL
                                OR lease_expires_at <= $4)
                         FOR UPDATE SKIP LOCKED
                     )
                     RETURNING {TARGET_COLUMNS}"
                ),
                &[&holder, &expires_at, &names, &now],
            )
            .await?;

        let mut claimed = rows
            .iter()
            .map(row_to_target)
            .collect::<CatalogResult<Vec<_>>>()?;

        // RETURNING order is unspecified; keep the candidate order
        let rank: std::collections::HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .rev()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        claimed.sort_by_key(|t| rank.get(t.name.as_str()).copied().unwrap_or(usize::MAX));
        Ok(claimed)
    }

    async fn renew(&self, holder: &str, ttl: Duration) -> CatalogResult<usize> {
        let expires_at = lease_expiry(Utc::now(), ttl);
        let client = self.pool.get().await?;
        let renewed = client
            .execute(
                "UPDATE targets SET lease_expires_at = $1 WHERE lease_holder = $2",
                &[&expires_at, &holder],
            )
            .await?;
        Ok(renewed as usize)
    }

    async fn release(&self, holder: &str) -> CatalogResult<usize> {
        let client = self.pool.get().await?;
        let released = client
            .execute(
                "UPDATE targets SET lease_holder = NULL, lease_expires_at = NULL
                 WHERE lease_holder = $1",
                &[&holder],
            )
            .await?;
        Ok(released as usize)
    }

    async fn record_outcome(
        &self,
        name: &str,
        outcome: &FitOutcome,
        recorded_at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE name = $1 FOR UPDATE"),
                &[&name],
            )
            .await?
            .ok_or_else(|| CatalogError::TargetNotFound(name.to_string()))?;

        let mut extras = row_to_target(&row)?.extras;
        outcome.apply_to(&mut extras, recorded_at);
        let fit_params = encode_fit(name, extras.fit.as_ref())?;
        let status = extras.last_fit_status.map(|s| s.as_str());

        tx.execute(
            "UPDATE targets SET alive = $1, last_fit = $2, fit_params = $3,
                 last_fit_status = $4, last_fit_error = $5
             WHERE name = $6",
            &[
                &extras.alive,
                &extras.last_fit,
                &fit_params,
                &status,
                &extras.last_fit_error,
                &name,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn active_leases(&self) -> CatalogResult<Vec<LeaseRecord>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT name, lease_holder, lease_expires_at FROM targets
                 WHERE lease_holder IS NOT NULL AND lease_expires_at > now()
                 ORDER BY name",
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| {
                Ok(LeaseRecord {
                    target: row.try_get(0)?,
                    holder: row.try_get(1)?,
                    expires_at: row.try_get(2)?,
                })
            })
            .collect()
    }

    async fn stats(&self) -> CatalogResult<CatalogStats> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*),
                        COUNT(*) FILTER (WHERE alive),
                        COUNT(*) FILTER (WHERE lease_holder IS NOT NULL AND lease_expires_at > now()),
                        COUNT(*) FILTER (WHERE last_fit_status = 'fitted'),
                        COUNT(*) FILTER (WHERE last_fit_status = 'skipped'),
                        COUNT(*) FILTER (WHERE last_fit_status = 'failed')
                 FROM targets",
                &[],
            )
            .await?;

        let count = |idx: usize| -> CatalogResult<usize> { Ok(row.try_get::<_, i64>(idx)? as usize) };
        Ok(CatalogStats {
            total: count(0)?,
            alive: count(1)?,
            leased: count(2)?,
            fitted: count(3)?,
            skipped: count(4)?,
            failed: count(5)?,
        })
    }
}

fn encode_fit(
    name: &str,
    fit: Option<&FitParameters>,
) -> CatalogResult<Option<serde_json::Value>> {
    fit.map(serde_json::to_value)
        .transpose()
        .map_err(|e| CatalogError::CorruptAttribute {
            target: name.to_string(),
            field: "fit_params".into(),
            reason: e.to_string(),
        })
}

fn row_to_target(row: &Row) -> CatalogResult<Target> {
    let name: String = row.try_get(0)?;

    let corrupt = |field: &str, reason: String| CatalogError::CorruptAttribute {
        target: name.clone(),
        field: field.to_string(),
        reason,
    };

    let fit = row
        .try_get::<_, Option<serde_json::Value>>(8)?
        .map(serde_json::from_value::<FitParameters>)
        .transpose()
        .map_err(|e| corrupt("fit_params", e.to_string()))?;

    let last_fit_status = row
        .try_get::<_, Option<String>>(9)?
        .map(|s| s.parse::<FitStatus>())
        .transpose()
        .map_err(|e| corrupt("last_fit_status", e))?;

    Ok(Target {
        position: SkyPosition {
            ra: row.try_get(1)?,
            dec: row.try_get(2)?,
        },
        extras: TargetExtras {
            classification: row.try_get(3)?,
            alive: row.try_get(4)?,
            last_fit: row.try_get(5)?,
            latest_data_jd: row.try_get(6)?,
            latest_data_utc: row.try_get(7)?,
            fit,
            last_fit_status,
            last_fit_error: row.try_get(10)?,
        },
        name,
    })
}
