//! Packaging of a merged payload into a distributable archive.
//!
//! Each call builds its own source tree,
//! `{output_root}/{version}/{entity_id}/{variant_id}.{uuid}/data/characters/{mirror_dir}/skins/skin0.bin`
//! plus `META/info.json`, and removes it once the tool is done. The archive
//! lands at `{package_root}/{entity_id}/{variant_id}.wad.client`; its
//! presence there is what marks a pair ready to serve.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::catalog::{Entity, Variant, BASE_VARIANT_ID};
use crate::config::ToolConfig;
use crate::error::{Result, SkinCacheError};
use crate::fetcher::payload_file_name;
use crate::process::{run_with_deadline, ToolInvocation};
use crate::version::VersionTag;

pub const PACKAGE_EXTENSION: &str = "wad.client";

/// A finished archive for one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPackage {
    pub entity_id: String,
    pub variant_id: String,
    pub path: PathBuf,
    /// Hex SHA-256 of the archive bytes.
    pub digest: String,
}

impl OutputPackage {
    /// Describe an archive already on disk.
    pub async fn from_existing(entity_id: &str, variant_id: &str, path: PathBuf) -> Result<Self> {
        let bytes = tokio::fs::read(&path).await?;
        Ok(Self {
            entity_id: entity_id.to_string(),
            variant_id: variant_id.to_string(),
            digest: hex::encode(Sha256::digest(&bytes)),
            path,
        })
    }
}

/// Deterministic package addressing, shared by the archiver and lookups.
#[derive(Debug, Clone)]
pub struct PackageLayout {
    package_root: PathBuf,
}

impl PackageLayout {
    pub fn new(package_root: impl Into<PathBuf>) -> Self {
        Self {
            package_root: package_root.into(),
        }
    }

    pub fn package_path(&self, entity_id: &str, variant_id: &str) -> PathBuf {
        self.package_root
            .join(entity_id)
            .join(format!("{variant_id}.{PACKAGE_EXTENSION}"))
    }

    pub async fn exists(&self, entity_id: &str, variant_id: &str) -> bool {
        tokio::fs::try_exists(self.package_path(entity_id, variant_id))
            .await
            .unwrap_or(false)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PackageInfo<'a> {
    name: String,
    author: &'a str,
    version: &'a str,
    description: String,
}

/// Builds the source tree and runs the external archiving tool.
pub struct PackageArchiver {
    tool: ToolConfig,
    output_root: PathBuf,
    layout: PackageLayout,
    info_template: Option<PathBuf>,
}

impl PackageArchiver {
    pub fn new(tool: ToolConfig, output_root: impl Into<PathBuf>, layout: PackageLayout) -> Self {
        Self {
            tool,
            output_root: output_root.into(),
            layout,
            info_template: None,
        }
    }

    pub fn with_info_template(mut self, template: Option<PathBuf>) -> Self {
        self.info_template = template;
        self
    }

    pub fn layout(&self) -> &PackageLayout {
        &self.layout
    }

    /// Fresh source tree location for one archive call.
    fn work_dir(&self, version: &VersionTag, entity_id: &str, variant_id: &str) -> PathBuf {
        self.output_root
            .join(version.as_str())
            .join(entity_id)
            .join(format!("{variant_id}.{}", uuid::Uuid::new_v4()))
    }

    /// Package `merged_binary` for the pair.
    ///
    /// The archive is produced under a unique temp name next to its final
    /// path and renamed into place only after the tool succeeds, so a failure
    /// never touches a previously published archive. Concurrent calls for the
    /// same pair each use their own source tree.
    pub async fn archive(
        &self,
        version: &VersionTag,
        merged_binary: &Path,
        entity: &Entity,
        variant: &Variant,
        mirror_dir: &str,
    ) -> Result<OutputPackage> {
        let pair = format!("{}/{}", entity.id, variant.id);
        if !tokio::fs::try_exists(merged_binary).await? {
            return Err(archive_failed(
                &pair,
                format!("merged payload missing: {}", merged_binary.display()),
            ));
        }

        let source = self.work_dir(version, &entity.id, &variant.id);
        let outcome = self
            .pack(&pair, &source, version, merged_binary, entity, variant, mirror_dir)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&source).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %source.display(), error = %e, "Could not remove package source tree");
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn pack(
        &self,
        pair: &str,
        source: &Path,
        version: &VersionTag,
        merged_binary: &Path,
        entity: &Entity,
        variant: &Variant,
        mirror_dir: &str,
    ) -> Result<OutputPackage> {
        let skins_dir = source
            .join("data")
            .join("characters")
            .join(mirror_dir)
            .join("skins");
        tokio::fs::create_dir_all(&skins_dir).await?;
        tokio::fs::copy(merged_binary, skins_dir.join(payload_file_name(BASE_VARIANT_ID))).await?;
        self.stage_metadata(source, version, entity, variant).await?;

        let dest = self.layout.package_path(&entity.id, &variant.id);
        let dest_dir = dest
            .parent()
            .ok_or_else(|| archive_failed(pair, format!("no parent for {}", dest.display())))?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let tmp = dest_dir.join(format!(".{}.{}.tmp", variant.id, uuid::Uuid::new_v4()));

        let invocation = ToolInvocation::new(&self.tool)
            .arg(source.as_os_str())
            .arg(tmp.as_os_str());
        let outcome = run_with_deadline(&invocation, self.tool.timeout()).await;

        let output = match outcome {
            Ok(output) if output.success() => output,
            Ok(output) => {
                discard(&tmp).await;
                return Err(archive_failed(
                    pair,
                    format!(
                        "archiver exited with {}: {}",
                        output.exit_code,
                        output.diagnostics()
                    ),
                ));
            }
            Err(e) => {
                discard(&tmp).await;
                return Err(archive_failed(pair, e.to_string()));
            }
        };

        let bytes = match tokio::fs::read(&tmp).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(archive_failed(pair, format!("archiver produced no archive: {e}"))),
        };
        let digest = hex::encode(Sha256::digest(&bytes));
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            discard(&tmp).await;
            return Err(e.into());
        }

        info!(
            pair = %pair,
            path = %dest.display(),
            bytes = bytes.len(),
            duration_ms = output.duration_ms,
            "Package written"
        );
        Ok(OutputPackage {
            entity_id: entity.id.clone(),
            variant_id: variant.id.clone(),
            path: dest,
            digest,
        })
    }

    async fn stage_metadata(
        &self,
        source: &Path,
        version: &VersionTag,
        entity: &Entity,
        variant: &Variant,
    ) -> Result<()> {
        let meta_dir = source.join("META");
        tokio::fs::create_dir_all(&meta_dir).await?;
        let info_path = meta_dir.join("info.json");

        if let Some(template) = &self.info_template {
            tokio::fs::copy(template, &info_path).await?;
            return Ok(());
        }

        let info = PackageInfo {
            name: format!("{} - {}", entity.display_name(), variant.display_name()),
            author: "skincache",
            version: version.as_str(),
            description: format!("{} skin {} for patch {}", entity.display_name(), variant.id, version),
        };
        tokio::fs::write(&info_path, serde_json::to_vec_pretty(&info)?).await?;
        Ok(())
    }
}

fn archive_failed(pair: &str, reason: String) -> SkinCacheError {
    SkinCacheError::ArchiveFailed {
        pair: pair.to_string(),
        reason,
    }
}

async fn discard(tmp: &Path) {
    if let Err(e) = tokio::fs::remove_file(tmp).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %tmp.display(), error = %e, "Could not remove partial archive");
        }
    }
}
