use std::path::PathBuf;

use anyhow::{Context, Result};

use mop_orchestrator::catalog;
use mop_orchestrator::utils::to_julian_date;

pub async fn status(config: Option<PathBuf>, database: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(config.as_deref(), database)?;
    config.validate()?;

    let catalog = catalog::open(&config.catalog)
        .await
        .context("Failed to open catalog")?;
    let stats = catalog.stats().await?;
    let leases = catalog.active_leases().await?;

    println!("Catalog Status");
    println!("==============");
    let now = chrono::Utc::now();
    println!("Backend: {:?}", config.catalog.backend);
    println!("Now: {} (JD {:.5})", now.to_rfc3339(), to_julian_date(now));
    println!("Targets: {}", stats.total);
    println!("Alive: {}", stats.alive);
    println!("Fitted: {}", stats.fitted);
    println!("Skipped: {}", stats.skipped);
    println!("Failed: {}", stats.failed);
    println!("Leased: {}", stats.leased);

    if !leases.is_empty() {
        println!("\nActive Leases");
        println!("-------------");
        for lease in &leases {
            println!(
                "  {} held by {} until {}",
                lease.target,
                lease.holder,
                lease.expires_at.to_rfc3339()
            );
        }
    }

    Ok(())
}
