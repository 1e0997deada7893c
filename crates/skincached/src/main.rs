//! skincached - periodic skincache updater.
//!
//! Triggers one batch run per interval. A tick that lands while a run is
//! still going is skipped. Ctrl-c cancels the current run before its next
//! pair and stops the loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use skincache_core::{metrics::METRICS, RunControl, SkinCache, SkinCacheConfig, SkinCacheError};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "skincached")]
#[command(version = skincache_core::VERSION)]
#[command(about = "skincache update daemon", long_about = None)]
struct Args {
    /// Config file (TOML); SKINCACHE_* variables override it
    #[arg(short, long, env = "SKINCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between runs (overrides interval-secs from config)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Seed the catalog from the newest upstream version before the first run
    #[arg(long)]
    seed_on_start: bool,

    /// Run once and exit
    #[arg(long)]
    once: bool,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    skincache_core::telemetry::init_tracing(args.json, level);

    let mut config =
        SkinCacheConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(secs) = args.interval_secs {
        config.interval_secs = secs;
    }
    let interval = Duration::from_secs(config.interval_secs.max(1));
    let cache = Arc::new(SkinCache::from_config(config).context("Failed to initialise skincache")?);

    info!(
        version = skincache_core::VERSION,
        interval_secs = interval.as_secs(),
        "skincached started"
    );

    if args.seed_on_start {
        seed(&cache).await;
    }

    let control = RunControl::new();
    if args.once {
        let stop = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });
        tick(&cache, &control).await;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                    METRICS.inc_runs_skipped();
                    info!(event = "run.skipped", "Previous run still in progress");
                    continue;
                }
                let cache = Arc::clone(&cache);
                let control = control.clone();
                in_flight = Some(tokio::spawn(async move { tick(&cache, &control).await }));
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Shutdown requested, stopping after in-flight pairs");
                control.cancel();
                break;
            }
        }
    }

    if let Some(handle) = in_flight {
        if let Err(e) = handle.await {
            error!(error = %e, "Update task panicked");
        }
    }
    info!("skincached stopped");
    Ok(())
}

async fn tick(cache: &SkinCache, control: &RunControl) {
    match cache.orchestrator().run(control).await {
        Ok(report) if report.is_idle() => {
            info!(version = %report.version, "Nothing stale");
        }
        Ok(report) => {
            info!(
                version = %report.version,
                entity = report.entity_id.as_deref().unwrap_or("-"),
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Update run complete"
            );
        }
        Err(SkinCacheError::RunInProgress) => {}
        // Retried on the next tick.
        Err(e) => warn!(kind = e.kind(), error = %e, "Update run aborted"),
    }
}

async fn seed(cache: &SkinCache) {
    let result = async {
        let raw = cache.latest_raw_version().await?;
        let count = cache.seed_catalog(&raw).await?;
        Ok::<_, SkinCacheError>((raw, count))
    }
    .await;
    match result {
        Ok((raw, count)) => info!(version = %raw, entities = count, "Catalog seeded"),
        Err(e) => warn!(error = %e, "Catalog seeding failed, using existing catalog"),
    }
}
