//! Variant merge: rewrite a variant's document against its entity's base.
//!
//! The packaging step always ships the base slot (`skin0.bin`), so a variant
//! is delivered by merging its document with the base identity fields and
//! encoding the result into the base slot of the pair's own staging directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::document::{resource_resolver_index, StructuredDocument};
use crate::error::{Result, SkinCacheError};
use crate::fetcher::{StagedPair, StagedPayload};
use crate::transcoder::Transcoder;

/// Merge `variant` against `base`.
///
/// 1. The first item's key becomes the base's first item key.
/// 2. If the base has a ResourceResolver item, the variant's ResourceResolver
///    key (if it has one) becomes the base's. A missing resolver is never added.
///
/// All other items are taken from `variant` unchanged.
pub fn merge_documents(
    variant: &StructuredDocument,
    base: &StructuredDocument,
) -> std::result::Result<StructuredDocument, String> {
    let base_title = base
        .title_key()
        .cloned()
        .ok_or_else(|| "base document has no title item".to_string())?;
    let base_resolver = base.resource_resolver_key().cloned();

    let mut merged = variant.clone();
    let items = merged
        .items_mut()
        .ok_or_else(|| "variant document has no entries.value.items".to_string())?;
    let first = items
        .first_mut()
        .and_then(|item| item.as_object_mut())
        .ok_or_else(|| "variant document has no title item".to_string())?;
    first.insert("key".to_string(), base_title);

    if let Some(resolver_key) = base_resolver {
        if let Some(index) = resource_resolver_index(items) {
            if let Some(item) = items[index].as_object_mut() {
                item.insert("key".to_string(), resolver_key);
            }
        }
    }

    Ok(merged)
}

/// Drives decode -> merge -> encode for a staged pair.
pub struct MergeEngine {
    transcoder: Arc<dyn Transcoder>,
    base_documents: Mutex<HashMap<PathBuf, Arc<StructuredDocument>>>,
}

impl MergeEngine {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            transcoder,
            base_documents: Mutex::new(HashMap::new()),
        }
    }

    /// Decoded base document for the shared base payload, decoded at most
    /// once per payload path.
    pub async fn base_document(&self, shared_base: &StagedPayload) -> Result<Arc<StructuredDocument>> {
        let mut cache = self.base_documents.lock().await;
        if let Some(doc) = cache.get(&shared_base.path) {
            return Ok(Arc::clone(doc));
        }
        let doc = Arc::new(self.transcoder.decode(&shared_base.path).await?);
        debug!(entity = %shared_base.entity_id, path = %shared_base.path.display(), "Base document decoded");
        cache.insert(shared_base.path.clone(), Arc::clone(&doc));
        Ok(doc)
    }

    /// Drop cached base documents staged under `root`.
    pub async fn release_bases_under(&self, root: &Path) {
        self.base_documents
            .lock()
            .await
            .retain(|path, _| !path.starts_with(root));
    }

    /// Keep only cached base documents staged under `root`.
    pub async fn retain_bases_under(&self, root: &Path) {
        self.base_documents
            .lock()
            .await
            .retain(|path, _| path.starts_with(root));
    }

    pub async fn cached_bases(&self) -> usize {
        self.base_documents.lock().await.len()
    }

    /// Merge the staged variant against `base` and encode the result into
    /// the pair's base slot. Returns the path of the rewritten `skin0.bin`.
    pub async fn rewrite_variant(&self, staged: &StagedPair, base: &StructuredDocument) -> Result<PathBuf> {
        if !tokio::fs::try_exists(&staged.variant.path).await? {
            warn!(
                entity = %staged.variant.entity_id,
                variant = %staged.variant.variant_id,
                path = %staged.variant.path.display(),
                "Variant payload absent after fetch, skipping merge"
            );
            return Err(SkinCacheError::PayloadMissing(
                staged.variant.path.display().to_string(),
            ));
        }

        let variant_doc = self.transcoder.decode(&staged.variant.path).await?;
        let variant_json = staged.variant.path.with_extension("json");

        let merged = merge_documents(&variant_doc, base).map_err(|reason| {
            SkinCacheError::MalformedDocument {
                path: variant_json.display().to_string(),
                reason,
            }
        })?;

        let slot_json = staged.slot_path().with_extension("json");
        merged.save(&slot_json).await?;
        let encoded = self.transcoder.encode(&slot_json).await?;

        remove_if_present(&variant_json).await;
        remove_if_present(&slot_json).await;

        info!(
            entity = %staged.variant.entity_id,
            variant = %staged.variant.variant_id,
            path = %encoded.display(),
            "Variant merged into base slot"
        );
        Ok(encoded)
    }
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove intermediate document");
        }
    }
}
