//! Serving-path package lookup.
//!
//! A published archive is returned as-is. On a miss the pair is built
//! synchronously with its own pipeline (separate staging root from batch
//! runs), so callers either get a complete package or the build error.
//! Builds hold the current version shared; the first build for a new version
//! takes it exclusively and prunes what was staged for older ones.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use skincache_ledger::{FreshnessLedger, PairKey};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::archiver::{OutputPackage, PackageLayout};
use crate::catalog::CatalogStore;
use crate::error::{Result, SkinCacheError};
use crate::catalog::{Entity, Variant};
use crate::metrics::METRICS;
use crate::orchestrator::flush_ledger;
use crate::pipeline::PairPipeline;
use crate::version::{VersionOracle, VersionTag};

pub struct PackageLookup {
    layout: PackageLayout,
    catalog: Arc<dyn CatalogStore>,
    oracle: Arc<dyn VersionOracle>,
    ledger: Arc<FreshnessLedger>,
    pipeline: Arc<PairPipeline>,
    /// One lock per pair with a build pending; entries go once unused.
    in_flight: Mutex<HashMap<PairKey, Arc<Mutex<()>>>>,
    staged_version: RwLock<Option<VersionTag>>,
}

impl PackageLookup {
    pub fn new(
        layout: PackageLayout,
        catalog: Arc<dyn CatalogStore>,
        oracle: Arc<dyn VersionOracle>,
        ledger: Arc<FreshnessLedger>,
        pipeline: Arc<PairPipeline>,
    ) -> Self {
        Self {
            layout,
            catalog,
            oracle,
            ledger,
            pipeline,
            in_flight: Mutex::new(HashMap::new()),
            staged_version: RwLock::new(None),
        }
    }

    /// Path of the published archive, if there is one.
    pub async fn find(&self, entity_id: &str, variant_id: &str) -> Option<PathBuf> {
        self.layout
            .exists(entity_id, variant_id)
            .await
            .then(|| self.layout.package_path(entity_id, variant_id))
    }

    /// The pair's package, building it first when it is not published.
    pub async fn get_or_build(&self, entity_id: &str, variant_id: &str) -> Result<OutputPackage> {
        if let Some(path) = self.find(entity_id, variant_id).await {
            debug!(entity = %entity_id, variant = %variant_id, "Package hit");
            return OutputPackage::from_existing(entity_id, variant_id, path).await;
        }

        let entity = self
            .catalog
            .entity(entity_id)
            .await?
            .ok_or_else(|| SkinCacheError::EntityNotFound(entity_id.to_string()))?;
        let variant = entity
            .variant(variant_id)
            .cloned()
            .ok_or_else(|| SkinCacheError::VariantNotFound {
                entity_id: entity_id.to_string(),
                variant_id: variant_id.to_string(),
            })?;
        if variant.is_base() {
            return Err(SkinCacheError::BaseVariantRequested(entity.id.clone()));
        }

        let key = PairKey::new(entity_id, variant_id);
        let pair_lock = self.pair_lock(&key).await;
        let result = {
            let _building = pair_lock.lock().await;
            self.build_pair(&entity, &variant).await
        };
        self.release_pair_lock(&key, pair_lock).await;
        result
    }

    /// Pairs with an on-demand build pending or running.
    pub async fn in_flight_pairs(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn build_pair(&self, entity: &Entity, variant: &Variant) -> Result<OutputPackage> {
        // A concurrent request may have finished the build while we waited.
        if let Some(path) = self.find(&entity.id, &variant.id).await {
            return OutputPackage::from_existing(&entity.id, &variant.id, path).await;
        }

        info!(entity = %entity.id, variant = %variant.id, "Package miss, building on demand");
        let version = self.oracle.current_version().await?;
        let _staged = self.enter_version(&version).await;
        let package = match self.pipeline.process(&version, entity, variant).await {
            Ok(package) => package,
            Err(e) => {
                METRICS.inc_pairs_failed();
                return Err(e);
            }
        };
        METRICS.inc_pairs_processed();

        self.ledger.mark_fresh(&entity.id, &variant.id, version.as_str());
        flush_ledger(&self.ledger).await?;
        Ok(package)
    }

    /// Shared hold on `version` for the length of a build.
    async fn enter_version(&self, version: &VersionTag) -> RwLockReadGuard<'_, Option<VersionTag>> {
        {
            let current = self.staged_version.read().await;
            if current.as_ref() == Some(version) {
                return current;
            }
        }
        let mut current = self.staged_version.write().await;
        if current.as_ref() != Some(version) {
            self.pipeline.prune_stale_versions(version).await;
            *current = Some(version.clone());
        }
        current.downgrade()
    }

    async fn pair_lock(&self, key: &PairKey) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        Arc::clone(in_flight.entry(key.clone()).or_default())
    }

    async fn release_pair_lock(&self, key: &PairKey, pair_lock: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // The map and this caller hold the only references: nobody is waiting.
        if Arc::strong_count(&pair_lock) == 2 {
            in_flight.remove(key);
        }
    }
}
