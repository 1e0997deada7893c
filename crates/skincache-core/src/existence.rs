//! Worklist construction from a published-packages repository.
//!
//! A pair belongs on the worklist when the repository has no package for it.
//! The worklist is addressed by display names, matching how the repository
//! lays out its files.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, Entity, Variant};
use crate::error::Result;

/// Name the catalog gives every entity's base skin.
const DEFAULT_VARIANT_NAME: &str = "default";

/// One `(entity_name, variant_name)` item to process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub entity_name: String,
    pub variant_name: String,
}

impl WorkItem {
    pub fn new(entity_name: impl Into<String>, variant_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            variant_name: variant_name.into(),
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.entity_name, self.variant_name)
    }
}

/// Answers whether a package for a pair is already published.
#[async_trait]
pub trait ExistenceCheck: Send + Sync {
    async fn exists(&self, entity: &Entity, variant: &Variant) -> bool;
}

/// Checks `{root}/skins/{entity_name}/{variant_name}.zip` with a HEAD request.
pub struct HttpExistenceCheck {
    client: reqwest::Client,
    root: String,
}

impl HttpExistenceCheck {
    pub fn new(client: reqwest::Client, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn package_url(&self, entity: &Entity, variant: &Variant) -> String {
        format!(
            "{}/skins/{}/{}.zip",
            self.root,
            entity.display_name(),
            sanitize_variant_name(variant.display_name())
        )
    }
}

#[async_trait]
impl ExistenceCheck for HttpExistenceCheck {
    async fn exists(&self, entity: &Entity, variant: &Variant) -> bool {
        let url = self.package_url(entity, variant);
        match self.client.head(&url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                // Unreachable counts as missing; the pair is rebuilt locally.
                warn!(url = %url, error = %e, "Existence check failed");
                false
            }
        }
    }
}

/// Repository file names use spaces for `/` and drop `:`.
pub fn sanitize_variant_name(name: &str) -> String {
    name.replace('/', " ").replace(':', "")
}

/// Every tracked, named pair that `check` reports missing, in catalog order.
pub async fn build_worklist(
    catalog: &dyn CatalogStore,
    check: &dyn ExistenceCheck,
    concurrency: usize,
) -> Result<Vec<WorkItem>> {
    let entities = catalog.entities().await?;
    let pairs: Vec<(&Entity, &Variant)> = entities
        .iter()
        .flat_map(|entity| {
            entity
                .tracked_variants()
                .filter(|v| !v.display_name().eq_ignore_ascii_case(DEFAULT_VARIANT_NAME))
                .map(move |variant| (entity, variant))
        })
        .collect();
    let checked = pairs.len();

    let missing: Vec<WorkItem> = stream::iter(pairs)
        .map(move |(entity, variant)| async move {
            if check.exists(entity, variant).await {
                None
            } else {
                debug!(entity = %entity.id, variant = %variant.id, "Package not published");
                Some(WorkItem::new(entity.display_name(), variant.display_name()))
            }
        })
        .buffered(concurrency.max(1))
        .filter_map(|item| async move { item })
        .collect()
        .await;

    info!(checked = checked, missing = missing.len(), "Worklist built");
    Ok(missing)
}
