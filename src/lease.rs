//! Skip-locked claiming of candidate targets
//!
//! [`LockCoordinator::claim_batch`] takes a lease on every free candidate in
//! one catalog transaction and silently leaves out the ones another instance
//! holds. The returned [`Lease`] lives as long as the batch; a background task
//! renews it so long fits do not let it lapse, and [`Lease::release`] frees the
//! rows at the end.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::models::Target;

/// Unique holder id for this process: `<host>-<pid>-<random>`
pub fn generate_holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| String::from("localhost"));
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &nonce[..8])
}

/// Claims candidate rows with exclusive, skip-on-contention semantics
pub struct LockCoordinator {
    catalog: Arc<dyn Catalog>,
    holder: String,
    ttl: Duration,
}

impl LockCoordinator {
    pub fn new(catalog: Arc<dyn Catalog>, ttl: Duration) -> Self {
        Self::with_holder(catalog, generate_holder_id(), ttl)
    }

    pub fn with_holder(catalog: Arc<dyn Catalog>, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            catalog,
            holder: holder.into(),
            ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Lease every candidate nobody else holds.
    ///
    /// Never waits on a held row. Fails only when the catalog itself fails.
    pub async fn claim_batch(&self, candidates: &[Target]) -> Result<Lease> {
        let names: Vec<String> = candidates.iter().map(|t| t.name.clone()).collect();
        let claimed = self.catalog.claim(&names, &self.holder, self.ttl).await?;
        let excluded = names.len().saturating_sub(claimed.len());

        info!(
            holder = %self.holder,
            candidates = names.len(),
            claimed = claimed.len(),
            excluded,
            "Claimed batch"
        );

        Ok(Lease {
            catalog: Arc::clone(&self.catalog),
            holder: self.holder.clone(),
            ttl: self.ttl,
            targets: claimed,
            excluded,
            renewal: None,
            released: false,
        })
    }
}

/// A batch-scoped hold on the claimed targets
pub struct Lease {
    catalog: Arc<dyn Catalog>,
    holder: String,
    ttl: Duration,
    targets: Vec<Target>,
    excluded: usize,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl Lease {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Claimed targets, as read inside the claim transaction
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Hand the claimed targets to the caller; the hold stays in place
    pub fn take_targets(&mut self) -> Vec<Target> {
        std::mem::take(&mut self.targets)
    }

    /// Candidates left out because another holder had them
    pub fn excluded(&self) -> usize {
        self.excluded
    }

    /// Start renewing the lease every third of its lifetime
    pub fn start_renewal(&mut self) {
        if self.renewal.is_some() {
            return;
        }

        let catalog = Arc::clone(&self.catalog);
        let holder = self.holder.clone();
        let ttl = self.ttl;
        let period = (ttl / 3).max(Duration::from_millis(100));

        self.renewal = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match catalog.renew(&holder, ttl).await {
                    Ok(renewed) => debug!(holder = %holder, renewed, "Lease renewed"),
                    Err(e) => warn!(holder = %holder, error = %e, "Lease renewal failed"),
                }
            }
        }));
    }

    /// Stop renewal and free every row this holder leased
    pub async fn release(mut self) -> Result<usize> {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        let released = self.catalog.release(&self.holder).await?;
        self.released = true;
        info!(holder = %self.holder, released, "Lease released");
        Ok(released)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        if !self.released {
            warn!(
                holder = %self.holder,
                "Lease dropped without release; rows stay held until expiry"
            );
        }
    }
}
