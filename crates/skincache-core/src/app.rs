//! Wiring of the pipeline components from a [`SkinCacheConfig`].

use std::path::PathBuf;
use std::sync::Arc;

use skincache_ledger::FreshnessLedger;
use tracing::info;

use crate::archiver::{PackageArchiver, PackageLayout};
use crate::catalog::{CatalogStore, JsonFileCatalog};
use crate::config::SkinCacheConfig;
use crate::error::Result;
use crate::existence::{build_worklist, HttpExistenceCheck, WorkItem};
use crate::fetcher::AssetFetcher;
use crate::lookup::PackageLookup;
use crate::merge::MergeEngine;
use crate::orchestrator::{OrchestratorSettings, UpdateOrchestrator};
use crate::pipeline::PairPipeline;
use crate::resolver::{ListingResolver, MirrorDirectoryResolver};
use crate::seed::CatalogSeeder;
use crate::transcoder::{ExternalTranscoder, Transcoder};
use crate::version::{HttpVersionOracle, PinnedVersion, VersionOracle};

/// Concurrent HEAD requests while building a worklist.
const EXISTENCE_CONCURRENCY: usize = 16;

/// Replaceable collaborators; [`SkinCache::from_config`] fills them with the
/// HTTP and external-tool implementations.
pub struct Collaborators {
    pub client: reqwest::Client,
    pub oracle: Arc<dyn VersionOracle>,
    pub catalog: Arc<dyn CatalogStore>,
    pub resolver: Arc<dyn MirrorDirectoryResolver>,
    pub transcoder: Arc<dyn Transcoder>,
}

/// A fully wired instance: one ledger shared by batch runs and lookups.
pub struct SkinCache {
    config: SkinCacheConfig,
    client: reqwest::Client,
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<FreshnessLedger>,
    orchestrator: UpdateOrchestrator,
    lookup: PackageLookup,
}

impl SkinCache {
    pub fn from_config(config: SkinCacheConfig) -> Result<Self> {
        let client = config.http_client()?;
        let oracle: Arc<dyn VersionOracle> = match &config.pinned_version {
            Some(pinned) => Arc::new(PinnedVersion::new(pinned.clone())),
            None => Arc::new(HttpVersionOracle::new(client.clone(), config.versions_url.clone())),
        };
        let collaborators = Collaborators {
            oracle,
            catalog: Arc::new(JsonFileCatalog::new(config.catalog_path())),
            resolver: Arc::new(ListingResolver::new(
                client.clone(),
                config.mirror_root.clone(),
                config.denylist.clone(),
            )),
            transcoder: Arc::new(ExternalTranscoder::new(config.transcoder.clone())),
            client,
        };
        Ok(Self::with_collaborators(config, collaborators))
    }

    pub fn with_collaborators(config: SkinCacheConfig, parts: Collaborators) -> Self {
        let ledger = Arc::new(FreshnessLedger::open(config.ledger_path()));
        let layout = PackageLayout::new(config.package_dir());
        let archiver = Arc::new(
            PackageArchiver::new(config.archiver.clone(), config.output_dir(), layout.clone())
                .with_info_template(config.info_template.clone()),
        );

        let pipeline_for = |staging_root: PathBuf| {
            Arc::new(PairPipeline::new(
                Arc::clone(&parts.resolver),
                AssetFetcher::new(parts.client.clone(), config.mirror_root.clone(), staging_root),
                MergeEngine::new(Arc::clone(&parts.transcoder)),
                Arc::clone(&archiver),
            ))
        };

        let orchestrator = UpdateOrchestrator::new(
            Arc::clone(&parts.oracle),
            Arc::clone(&parts.catalog),
            Arc::clone(&ledger),
            pipeline_for(config.staging_dir()),
            OrchestratorSettings {
                per_entity_cap: config.per_entity_cap,
                workers: config.workers,
            },
        );
        let lookup = PackageLookup::new(
            layout,
            Arc::clone(&parts.catalog),
            Arc::clone(&parts.oracle),
            Arc::clone(&ledger),
            pipeline_for(config.on_demand_staging_dir()),
        );

        info!(
            data_root = %config.data_root.display(),
            ledger_records = ledger.len(),
            "skincache initialised"
        );
        Self {
            client: parts.client,
            catalog: parts.catalog,
            config,
            ledger,
            orchestrator,
            lookup,
        }
    }

    pub fn config(&self) -> &SkinCacheConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<FreshnessLedger> {
        &self.ledger
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn orchestrator(&self) -> &UpdateOrchestrator {
        &self.orchestrator
    }

    pub fn lookup(&self) -> &PackageLookup {
        &self.lookup
    }

    /// Newest raw upstream version, as the seeder expects it.
    pub async fn latest_raw_version(&self) -> Result<String> {
        HttpVersionOracle::new(self.client.clone(), self.config.versions_url.clone())
            .latest_raw()
            .await
    }

    /// Rewrite the catalog file from the upstream champion data.
    pub async fn seed_catalog(&self, raw_version: &str) -> Result<usize> {
        let catalog = JsonFileCatalog::new(self.config.catalog_path());
        CatalogSeeder::new(self.client.clone(), self.config.catalog_data_url.clone())
            .seed(raw_version, &catalog)
            .await
    }

    /// Pairs missing from the published-packages repository.
    pub async fn build_worklist(&self) -> Result<Vec<WorkItem>> {
        let check = HttpExistenceCheck::new(self.client.clone(), self.config.existence_root.clone());
        build_worklist(self.catalog.as_ref(), &check, EXISTENCE_CONCURRENCY).await
    }
}
