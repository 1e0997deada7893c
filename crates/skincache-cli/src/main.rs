//! skincache - incremental skin package cache CLI
//!
//! ## Commands
//!
//! - `run`: one batch update over the first entity with stale variants
//! - `worklist`: build the pairs missing from the published repository
//! - `get`: return a pair's package, building it on a miss
//! - `status`: show ledger records and published packages
//! - `seed`: rewrite the catalog from upstream champion data

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use skincache_core::{RunControl, RunReport, SkinCache, SkinCacheConfig};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "skincache")]
#[command(version = skincache_core::VERSION)]
#[command(about = "Incremental skin package cache", long_about = None)]
struct Cli {
    /// Config file (TOML); SKINCACHE_* variables override it
    #[arg(short, long, global = true, env = "SKINCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one batch update
    Run {
        /// Max variants of the selected entity to process
        #[arg(long)]
        cap: Option<usize>,

        /// Process every stale variant of the selected entity
        #[arg(long, conflicts_with = "cap")]
        drain: bool,

        /// Variants processed concurrently (1-8)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Build pairs that the published repository does not have
    Worklist {
        /// Only print the worklist
        #[arg(long)]
        dry_run: bool,
    },

    /// Return the package for a pair, building it if missing
    Get {
        entity_id: String,
        variant_id: String,
    },

    /// Show ledger records and published packages
    Status {
        /// Limit output to one entity
        #[arg(short, long)]
        entity: Option<String>,
    },

    /// Rewrite the catalog from upstream champion data
    Seed {
        /// Raw upstream version to seed from (default: newest)
        #[arg(long)]
        version: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    skincache_core::telemetry::init_tracing(cli.json, level);

    let mut config =
        SkinCacheConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Commands::Run { cap, drain, workers } = &cli.command {
        if let Some(cap) = cap {
            config.per_entity_cap = *cap;
        }
        if *drain {
            config.per_entity_cap = 0;
        }
        if let Some(workers) = workers {
            config.workers = *workers;
        }
    }
    let cache = SkinCache::from_config(config).context("Failed to initialise skincache")?;

    match cli.command {
        Commands::Run { .. } => cmd_run(&cache, cli.json).await,
        Commands::Worklist { dry_run } => cmd_worklist(&cache, dry_run, cli.json).await,
        Commands::Get {
            entity_id,
            variant_id,
        } => cmd_get(&cache, &entity_id, &variant_id, cli.json).await,
        Commands::Status { entity } => cmd_status(&cache, entity.as_deref(), cli.json).await,
        Commands::Seed { version } => cmd_seed(&cache, version).await,
    }
}

/// Cancel `control` on ctrl-c; the run stops before its next pair.
fn cancel_on_ctrl_c(control: &RunControl) {
    let control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight pairs");
            control.cancel();
        }
    });
}

async fn cmd_run(cache: &SkinCache, json: bool) -> Result<()> {
    let control = RunControl::new();
    cancel_on_ctrl_c(&control);

    let report = cache
        .orchestrator()
        .run(&control)
        .await
        .context("Update run failed")?;
    print_report(&report, json)
}

async fn cmd_worklist(cache: &SkinCache, dry_run: bool, json: bool) -> Result<()> {
    let items = cache
        .build_worklist()
        .await
        .context("Failed to build worklist")?;

    if dry_run {
        if json {
            println!("{}", serde_json::to_string_pretty(&items)?);
        } else {
            for item in &items {
                println!("{item}");
            }
            println!("{} missing", items.len());
        }
        return Ok(());
    }

    let control = RunControl::new();
    cancel_on_ctrl_c(&control);
    let report = cache
        .orchestrator()
        .run_worklist(items, &control)
        .await
        .context("Worklist run failed")?;
    print_report(&report, json)
}

async fn cmd_get(cache: &SkinCache, entity_id: &str, variant_id: &str, json: bool) -> Result<()> {
    let package = cache
        .lookup()
        .get_or_build(entity_id, variant_id)
        .await
        .with_context(|| format!("No package for {entity_id}/{variant_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&package)?);
    } else {
        println!("{}", package.path.display());
        println!("sha256: {}", package.digest);
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusRow {
    entity_id: String,
    variant_id: String,
    version: String,
    updated_at: String,
    published: bool,
}

async fn cmd_status(cache: &SkinCache, entity: Option<&str>, json: bool) -> Result<()> {
    let layout = skincache_core::PackageLayout::new(cache.config().package_dir());
    let mut rows = Vec::new();
    for (key, record) in cache.ledger().snapshot() {
        if entity.is_some_and(|e| e != key.entity_id) {
            continue;
        }
        let published = layout.exists(&key.entity_id, &key.variant_id).await;
        rows.push(StatusRow {
            entity_id: key.entity_id,
            variant_id: key.variant_id,
            version: record.version,
            updated_at: record.updated_at.to_rfc3339(),
            published,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No ledger records in {}", cache.ledger().path().display());
        return Ok(());
    }
    for row in &rows {
        println!(
            "{:>6}/{:<4} {:<8} {} {}",
            row.entity_id,
            row.variant_id,
            row.version,
            row.updated_at,
            if row.published { "published" } else { "missing" }
        );
    }
    println!("{} records", rows.len());
    Ok(())
}

async fn cmd_seed(cache: &SkinCache, version: Option<String>) -> Result<()> {
    let raw_version = match version {
        Some(v) => v,
        None => cache
            .latest_raw_version()
            .await
            .context("Failed to resolve upstream version")?,
    };
    let count = cache
        .seed_catalog(&raw_version)
        .await
        .with_context(|| format!("Failed to seed catalog for {raw_version}"))?;
    info!(version = %raw_version, entities = count, "Catalog seeded");
    println!("Seeded {count} entities from {raw_version}");
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render_report(report));
    }
    Ok(())
}

fn render_report(report: &RunReport) -> String {
    let mut out = format!("run {} at version {}\n", report.run_id, report.version);
    if report.is_idle() {
        out.push_str("nothing stale\n");
    }
    for package in &report.succeeded {
        out.push_str(&format!(
            "  ok     {}/{} {}\n",
            package.entity_id,
            package.variant_id,
            package.path.display()
        ));
    }
    for failure in &report.failed {
        out.push_str(&format!(
            "  failed {}/{} [{}] {}\n",
            failure.entity_id, failure.variant_id, failure.kind, failure.error
        ));
    }
    if report.skipped > 0 {
        out.push_str(&format!("  {} already fresh\n", report.skipped));
    }
    if report.cancelled {
        out.push_str("  cancelled before all pairs started\n");
    }
    out.push_str(&format!(
        "{} built, {} failed in {}ms\n",
        report.succeeded.len(),
        report.failed.len(),
        report.duration_ms
    ));
    out
}
