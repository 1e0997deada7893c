//! Raw payload retrieval from the content mirror into the staging tree.
//!
//! Layout under `{staging_root}/{version}/{entity_id}/`:
//!
//! - `base/{mirror_dir}/skin0.bin`: shared base payload, fetched if absent
//! - `{variant_id}/{mirror_dir}/skin{variant_id}.bin`: variant payload
//!
//! The merge result is encoded into `{variant_id}/{mirror_dir}/skin0.bin`,
//! which the fetcher never writes. A pair's directory is removed once its
//! package is built; directories of other versions are pruned as a whole.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::BASE_VARIANT_ID;
use crate::error::{Result, SkinCacheError};
use crate::version::VersionTag;

/// A payload file in the staging tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPayload {
    pub entity_id: String,
    pub variant_id: String,
    pub path: PathBuf,
}

/// Everything staged for one pair: its own directory, the entity's shared
/// base payload and the variant payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPair {
    pub dir: PathBuf,
    pub base: StagedPayload,
    pub variant: StagedPayload,
}

impl StagedPair {
    /// Base slot the merged document is encoded into. Absent until then.
    pub fn slot_path(&self) -> PathBuf {
        self.dir.join(payload_file_name(BASE_VARIANT_ID))
    }
}

pub fn payload_file_name(variant_id: &str) -> String {
    format!("skin{variant_id}.bin")
}

/// Downloads payloads from `{mirror_root}/{version}/game/data/characters/...`.
pub struct AssetFetcher {
    client: reqwest::Client,
    mirror_root: String,
    staging_root: PathBuf,
    /// Serializes base downloads so concurrent variants fetch it once.
    base_lock: Mutex<()>,
}

impl AssetFetcher {
    pub fn new(client: reqwest::Client, mirror_root: impl Into<String>, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            mirror_root: mirror_root.into().trim_end_matches('/').to_string(),
            staging_root: staging_root.into(),
            base_lock: Mutex::new(()),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn payload_url(&self, version: &VersionTag, mirror_dir: &str, variant_id: &str) -> String {
        format!(
            "{}/{}/game/data/characters/{}/skins/{}",
            self.mirror_root,
            version,
            mirror_dir,
            payload_file_name(variant_id)
        )
    }

    pub fn version_dir(&self, version: &VersionTag) -> PathBuf {
        self.staging_root.join(version.as_str())
    }

    pub fn entity_dir(&self, version: &VersionTag, entity_id: &str) -> PathBuf {
        self.version_dir(version).join(entity_id)
    }

    pub fn base_dir(&self, version: &VersionTag, entity_id: &str, mirror_dir: &str) -> PathBuf {
        self.entity_dir(version, entity_id).join("base").join(mirror_dir)
    }

    /// Root of everything staged for one pair.
    pub fn pair_dir(&self, version: &VersionTag, entity_id: &str, variant_id: &str) -> PathBuf {
        self.entity_dir(version, entity_id).join(variant_id)
    }

    pub fn variant_dir(&self, version: &VersionTag, entity_id: &str, variant_id: &str, mirror_dir: &str) -> PathBuf {
        self.pair_dir(version, entity_id, variant_id).join(mirror_dir)
    }

    /// Remove a pair's staging directory.
    pub async fn discard_pair(&self, version: &VersionTag, entity_id: &str, variant_id: &str) {
        remove_dir_if_present(&self.pair_dir(version, entity_id, variant_id)).await;
    }

    /// Remove an entity's staging directory, shared base included.
    pub async fn discard_entity(&self, version: &VersionTag, entity_id: &str) {
        remove_dir_if_present(&self.entity_dir(version, entity_id)).await;
    }

    /// Remove the staging trees of every version other than `version`.
    pub async fn prune_versions_except(&self, version: &VersionTag) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.staging_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut pruned = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == version.as_str() || !entry.file_type().await?.is_dir() {
                continue;
            }
            remove_dir_if_present(&entry.path()).await;
            pruned += 1;
        }
        if pruned > 0 {
            info!(root = %self.staging_root.display(), pruned = pruned, "Pruned stale staging versions");
        }
        Ok(pruned)
    }

    /// Stage the entity's base payload. Downloaded only if not already
    /// present in this version's staging tree.
    pub async fn fetch_base(&self, version: &VersionTag, entity_id: &str, mirror_dir: &str) -> Result<StagedPayload> {
        let path = self
            .base_dir(version, entity_id, mirror_dir)
            .join(payload_file_name(BASE_VARIANT_ID));

        let _guard = self.base_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            debug!(entity = %entity_id, path = %path.display(), "Base payload already staged");
        } else {
            let url = self.payload_url(version, mirror_dir, BASE_VARIANT_ID);
            self.download(&url, &path).await?;
        }

        Ok(StagedPayload {
            entity_id: entity_id.to_string(),
            variant_id: BASE_VARIANT_ID.to_string(),
            path,
        })
    }

    /// Stage a variant: ensure the shared base is present and download the
    /// variant payload unconditionally.
    pub async fn fetch_variant(
        &self,
        version: &VersionTag,
        entity_id: &str,
        variant_id: &str,
        mirror_dir: &str,
    ) -> Result<StagedPair> {
        let shared_base = self.fetch_base(version, entity_id, mirror_dir).await?;

        let dir = self.variant_dir(version, entity_id, variant_id, mirror_dir);
        // Leftovers of an interrupted build must not be mistaken for output.
        remove_dir_if_present(&dir).await;
        tokio::fs::create_dir_all(&dir).await?;

        let variant_path = dir.join(payload_file_name(variant_id));
        let url = self.payload_url(version, mirror_dir, variant_id);
        self.download(&url, &variant_path).await?;

        Ok(StagedPair {
            dir,
            base: shared_base,
            variant: StagedPayload {
                entity_id: entity_id.to_string(),
                variant_id: variant_id.to_string(),
                path: variant_path,
            },
        })
    }

    /// GET `url` into `dest` via a temp sibling, so a failed transfer never
    /// leaves a truncated file at `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let failed = |reason: String| SkinCacheError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        info!(url = %url, dest = %dest.display(), "Fetching payload");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("status {}", response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

        let parent = dest
            .parent()
            .ok_or_else(|| failed(format!("no parent for {}", dest.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".{}.part", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        if let Err(e) = file.write_all(&bytes).await {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, dest).await?;

        debug!(url = %url, bytes = bytes.len(), "Payload staged");
        Ok(())
    }
}

async fn remove_dir_if_present(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "Could not remove staging directory");
        }
    }
}
