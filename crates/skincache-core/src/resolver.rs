//! Mirror directory resolution.
//!
//! The mirror stores each entity under a directory whose name is derived
//! from, but not guaranteed equal to, the entity code. The directory index is
//! an HTML listing; it is downloaded once per version and cached.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::Entity;
use crate::error::{Result, SkinCacheError};
use crate::version::VersionTag;

/// Maps an entity to its directory name on the mirror.
#[async_trait]
pub trait MirrorDirectoryResolver: Send + Sync {
    async fn resolve(&self, version: &VersionTag, entity: &Entity) -> Result<String>;
}

/// Resolver backed by the mirror's `characters/` directory listing.
pub struct ListingResolver {
    client: reqwest::Client,
    mirror_root: String,
    denylist: Vec<String>,
    listings: Mutex<HashMap<VersionTag, Arc<Vec<String>>>>,
}

impl ListingResolver {
    pub fn new(client: reqwest::Client, mirror_root: impl Into<String>, denylist: Vec<String>) -> Self {
        Self {
            client,
            mirror_root: mirror_root.into().trim_end_matches('/').to_string(),
            denylist: denylist.into_iter().map(|d| d.to_lowercase()).collect(),
            listings: Mutex::new(HashMap::new()),
        }
    }

    pub fn listing_url(&self, version: &VersionTag) -> String {
        format!("{}/{}/game/data/characters/", self.mirror_root, version)
    }

    /// Filtered directory names for `version`, downloading them on first use.
    pub async fn directories(&self, version: &VersionTag) -> Result<Arc<Vec<String>>> {
        // Held across the download so concurrent pairs share one request.
        let mut listings = self.listings.lock().await;
        if let Some(dirs) = listings.get(version) {
            return Ok(Arc::clone(dirs));
        }

        let url = self.listing_url(version);
        let unavailable = |reason: String| SkinCacheError::UpstreamUnavailable(format!("{url}: {reason}"));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status())));
        }
        let html = response.text().await.map_err(|e| unavailable(e.to_string()))?;

        let dirs = Arc::new(parse_listing(&html, &self.denylist));
        info!(version = %version, directories = dirs.len(), "Mirror listing loaded");
        listings.insert(version.clone(), Arc::clone(&dirs));
        Ok(dirs)
    }
}

#[async_trait]
impl MirrorDirectoryResolver for ListingResolver {
    async fn resolve(&self, version: &VersionTag, entity: &Entity) -> Result<String> {
        let dirs = self.directories(version).await?;
        let found = match_directory(&dirs, &entity.code).ok_or_else(|| {
            SkinCacheError::DirectoryNotFound {
                entity_id: entity.id.clone(),
                code: entity.code.clone(),
            }
        })?;
        debug!(entity = %entity.id, mirror_dir = %found, "Resolved mirror directory");
        Ok(found.to_string())
    }
}

/// Extract directory names from an HTML listing, dropping denylisted entries.
///
/// `denylist` entries are expected lowercase.
pub fn parse_listing(html: &str, denylist: &[String]) -> Vec<String> {
    static HREF: OnceLock<Regex> = OnceLock::new();
    let href = HREF.get_or_init(|| Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*"([^"]+)""#).expect("valid regex"));

    href.captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|link| {
            let lower = link.to_lowercase();
            !denylist.iter().any(|deny| lower.contains(deny.as_str()))
        })
        .map(|link| link.trim_end_matches('/').to_string())
        .filter(|name| !name.is_empty() && name != ".." && !name.contains('/') && !name.contains('?'))
        .collect()
}

/// Case-insensitive exact match of `code` against the listing.
pub fn match_directory<'a>(dirs: &'a [String], code: &str) -> Option<&'a str> {
    dirs.iter()
        .map(String::as_str)
        .find(|dir| dir.eq_ignore_ascii_case(code))
}
