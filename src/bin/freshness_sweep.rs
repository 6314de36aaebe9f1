use anyhow::{Context, Result};
use bargain_engine::config::{max_age_from_hours, EngineConfig};
use bargain_engine::database_ops::alerts::AlertTrigger;
use bargain_engine::tracing::init_tracing;
use bargain_engine::util::env::{self, preflight_check};
use bargain_engine::{PriceChange, PriceEngine};
use clap::Parser;
use serde::Serialize;
use tracing::info;

/// One backfill-and-detect cycle, printed as JSON lines for a downstream dispatcher.
#[derive(Parser, Debug)]
#[command(name = "freshness_sweep", version, about = "Run one price freshness sweep")]
struct Cli {
    /// Override BACKFILL_PAGE_SIZE for this run
    #[arg(long)]
    page_size: Option<i64>,
    /// Freshness window for the stale sweep, in hours (defaults to PRICE_CACHE_MAX_AGE_HOURS)
    #[arg(long)]
    max_age_hours: Option<i64>,
    /// Override STALE_SWEEP_LIMIT for this run
    #[arg(long)]
    stale_limit: Option<i64>,
    /// Only backfill games without prices
    #[arg(long, default_value_t = false)]
    skip_stale: bool,
    /// Do not evaluate favorites against the detected changes
    #[arg(long, default_value_t = false)]
    no_alerts: bool,
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Change(&'a PriceChange),
    Alert(&'a AlertTrigger),
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("info,bargain_engine=info,sqlx=warn")?;
    preflight_check(
        "freshness_sweep",
        &[],
        &["DATABASE_URL", "PRICE_CACHE_MAX_AGE_HOURS", "BACKFILL_PAGE_SIZE"],
    )?;

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(page_size) = cli.page_size {
        config.backfill_page_size = page_size.max(1);
    }
    if let Some(url) = cli.db_url {
        config.database_url = url;
    }
    let engine = PriceEngine::connect(config)
        .await
        .context("connecting price engine")?;

    let mut changes = engine
        .run_freshness_sweep()
        .await
        .context("freshness sweep")?;
    if !cli.skip_stale {
        let max_age = cli.max_age_hours.and_then(max_age_from_hours);
        let stale = engine
            .run_stale_sweep(max_age, cli.stale_limit)
            .await
            .context("stale sweep")?;
        changes.extend(stale);
    }

    let alerts = if cli.no_alerts {
        Vec::new()
    } else {
        engine
            .evaluate_alerts(&changes)
            .await
            .context("evaluating alerts")?
    };

    for change in &changes {
        println!("{}", serde_json::to_string(&Line::Change(change))?);
    }
    for alert in &alerts {
        println!("{}", serde_json::to_string(&Line::Alert(alert))?);
    }
    info!(changes = changes.len(), alerts = alerts.len(), "sweep complete");
    Ok(())
}
