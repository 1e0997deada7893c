//! Catalog seeding from the upstream champion data documents.

use std::collections::HashMap;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::catalog::{Entity, JsonFileCatalog, Variant};
use crate::error::{Result, SkinCacheError};

const DETAIL_CONCURRENCY: usize = 8;

#[derive(Debug, Deserialize)]
struct ChampionIndex {
    data: HashMap<String, ChampionSummary>,
}

#[derive(Debug, Deserialize)]
struct ChampionSummary {
    id: String,
    key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChampionDetailDoc {
    data: HashMap<String, ChampionDetail>,
}

#[derive(Debug, Deserialize)]
struct ChampionDetail {
    key: String,
    id: String,
    name: String,
    #[serde(default)]
    skins: Vec<SkinDetail>,
}

#[derive(Debug, Deserialize)]
struct SkinDetail {
    num: u32,
    name: String,
}

/// Downloads the champion list for `raw_version` and builds catalog entities.
pub struct CatalogSeeder {
    client: reqwest::Client,
    data_url: String,
    locale: String,
}

impl CatalogSeeder {
    pub fn new(client: reqwest::Client, data_url: impl Into<String>) -> Self {
        Self {
            client,
            data_url: data_url.into().trim_end_matches('/').to_string(),
            locale: "en_US".to_string(),
        }
    }

    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = locale.to_string();
        self
    }

    /// Fetch every champion and its skins. Entities come back ordered by
    /// numeric id.
    pub async fn fetch_entities(&self, raw_version: &str) -> Result<Vec<Entity>> {
        let index_url = format!(
            "{}/{}/data/{}/champion.json",
            self.data_url, raw_version, self.locale
        );
        let index: ChampionIndex = self.get_json(&index_url).await?;
        info!(version = %raw_version, champions = index.data.len(), "Fetched champion index");

        let mut entities: Vec<Entity> = stream::iter(index.data.into_values())
            .map(move |summary| self.fetch_entity(raw_version, summary))
            .buffer_unordered(DETAIL_CONCURRENCY)
            .try_collect()
            .await?;

        entities.sort_by(|a, b| numeric_order(&a.id, &b.id));
        Ok(entities)
    }

    /// Fetch and write the catalog file. Returns the number of entities.
    pub async fn seed(&self, raw_version: &str, catalog: &JsonFileCatalog) -> Result<usize> {
        let entities = self.fetch_entities(raw_version).await?;
        catalog.write(&entities)?;
        info!(path = %catalog.path().display(), entities = entities.len(), "Catalog seeded");
        Ok(entities.len())
    }

    async fn fetch_entity(&self, raw_version: &str, summary: ChampionSummary) -> Result<Entity> {
        let url = format!(
            "{}/{}/data/{}/champion/{}.json",
            self.data_url, raw_version, self.locale, summary.id
        );
        let doc: ChampionDetailDoc = self.get_json(&url).await?;
        let detail = doc
            .data
            .into_values()
            .find(|d| d.key == summary.key)
            .ok_or_else(|| {
                SkinCacheError::Catalog(format!("detail for {} missing from {url}", summary.name))
            })?;
        debug!(entity = %detail.key, skins = detail.skins.len(), "Fetched champion detail");
        Ok(entity_from_detail(detail))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let unavailable = |reason: String| SkinCacheError::UpstreamUnavailable(format!("{url}: {reason}"));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| unavailable(format!("malformed document: {e}")))
    }
}

fn entity_from_detail(detail: ChampionDetail) -> Entity {
    Entity {
        id: detail.key,
        code: detail.id,
        name: Some(detail.name),
        variants: detail
            .skins
            .into_iter()
            .map(|skin| Variant::new(skin.num.to_string(), Some(&skin.name)))
            .collect(),
    }
}

fn numeric_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
