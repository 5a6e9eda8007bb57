use std::path::PathBuf;

use anyhow::{Context, Result};

use mop_orchestrator::brokers::{NameBroker, NameQuery, TnsClient};
use mop_orchestrator::catalog;

pub async fn classify(
    name: String,
    tns_name: Option<String>,
    update: bool,
    config: Option<PathBuf>,
    database: Option<PathBuf>,
) -> Result<()> {
    let config = super::load_config(config.as_deref(), database)?;
    config.validate()?;

    let client = TnsClient::new(&config.tns).context("Failed to create TNS client")?;
    let catalog = catalog::open(&config.catalog)
        .await
        .context("Failed to open catalog")?;

    let mut target = catalog
        .get_target(&name)
        .await?
        .with_context(|| format!("Target '{name}' not found in catalog"))?;

    // TNS names drop the survey prefix, so a position lookup is the fallback
    let query = match tns_name {
        Some(tns_name) => NameQuery::Name(tns_name),
        None => NameQuery::Position {
            position: target.position,
            radius_arcsec: 2.0,
        },
    };
    let classification = client.lookup(&query).await?;

    println!("{name}: {classification}");

    if update {
        target.extras.classification = Some(classification);
        catalog.upsert_target(&target).await?;
        tracing::info!(target = %name, "Classification updated");
    }

    Ok(())
}
