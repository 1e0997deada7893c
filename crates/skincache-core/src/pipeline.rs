//! The per-pair pipeline: resolve -> fetch -> decode -> merge -> encode -> archive.
//!
//! Shared by batch runs and on-demand lookups. Each call stages into its own
//! `{variant_id}` subdirectory, so calls for different variants of the same
//! entity may run concurrently. Only the entity's shared base payload and its
//! decoded document outlive a call.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::archiver::{OutputPackage, PackageArchiver};
use crate::catalog::{Entity, Variant};
use crate::error::{Result, SkinCacheError};
use crate::fetcher::AssetFetcher;
use crate::merge::MergeEngine;
use crate::resolver::MirrorDirectoryResolver;
use crate::version::VersionTag;

pub struct PairPipeline {
    resolver: Arc<dyn MirrorDirectoryResolver>,
    fetcher: AssetFetcher,
    merger: MergeEngine,
    archiver: Arc<PackageArchiver>,
}

impl PairPipeline {
    pub fn new(
        resolver: Arc<dyn MirrorDirectoryResolver>,
        fetcher: AssetFetcher,
        merger: MergeEngine,
        archiver: Arc<PackageArchiver>,
    ) -> Self {
        Self {
            resolver,
            fetcher,
            merger,
            archiver,
        }
    }

    pub fn archiver(&self) -> &PackageArchiver {
        &self.archiver
    }

    /// Build the package for one non-base variant. The pair's staging
    /// directory is removed afterwards, whatever the outcome.
    #[instrument(skip_all, fields(entity = %entity.id, variant = %variant.id, version = %version))]
    pub async fn process(&self, version: &VersionTag, entity: &Entity, variant: &Variant) -> Result<OutputPackage> {
        if variant.is_base() {
            return Err(SkinCacheError::BaseVariantRequested(entity.id.clone()));
        }

        let result = self.build(version, entity, variant).await;
        self.fetcher.discard_pair(version, &entity.id, &variant.id).await;
        result
    }

    async fn build(&self, version: &VersionTag, entity: &Entity, variant: &Variant) -> Result<OutputPackage> {
        let mirror_dir = self.resolver.resolve(version, entity).await?;

        let staged = self
            .fetcher
            .fetch_variant(version, &entity.id, &variant.id, &mirror_dir)
            .await?;
        debug!(dir = %staged.dir.display(), "Pair staged");

        let base_doc = self.merger.base_document(&staged.base).await?;
        let merged = self.merger.rewrite_variant(&staged, &base_doc).await?;

        self.archiver
            .archive(version, &merged, entity, variant, &mirror_dir)
            .await
    }

    /// Drop everything kept for an entity once its batch is done: the
    /// decoded base document and the shared base payload.
    pub async fn release_entity(&self, version: &VersionTag, entity_id: &str) {
        let entity_dir = self.fetcher.entity_dir(version, entity_id);
        self.merger.release_bases_under(&entity_dir).await;
        self.fetcher.discard_entity(version, entity_id).await;
    }

    /// Forget staged payloads and cached base documents of other versions.
    pub async fn prune_stale_versions(&self, version: &VersionTag) {
        self.merger
            .retain_bases_under(&self.fetcher.version_dir(version))
            .await;
        if let Err(e) = self.fetcher.prune_versions_except(version).await {
            warn!(
                root = %self.fetcher.staging_root().display(),
                error = %e,
                "Could not prune stale staging versions"
            );
        }
    }

    pub fn fetcher(&self) -> &AssetFetcher {
        &self.fetcher
    }

    pub fn merger(&self) -> &MergeEngine {
        &self.merger
    }
}
