//! Entity/variant catalog.
//!
//! The catalog is owned by an external seeding step; the update pipeline only
//! reads it through [`CatalogStore`].

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, SkinCacheError};

/// Variant id reserved for the base skin of every entity.
pub const BASE_VARIANT_ID: &str = "0";

/// A cosmetic variant ("skin") of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    /// Skin number as a string; `"0"` is the base variant.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Variant {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn is_base(&self) -> bool {
        self.id == BASE_VARIANT_ID
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A playable character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable identifier (numeric key upstream).
    pub id: String,
    /// Short code used to locate the entity's directory on the mirror.
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl Entity {
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    /// Variants that are tracked independently (everything but the base).
    pub fn tracked_variants(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter().filter(|v| !v.is_base())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.code)
    }

    /// Variant whose display name matches `name`, ignoring case.
    pub fn variant_by_name(&self, name: &str) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|v| v.display_name().eq_ignore_ascii_case(name))
    }
}

/// First entity whose display name matches `name`, ignoring case.
pub fn entity_by_name<'a>(entities: &'a [Entity], name: &str) -> Option<&'a Entity> {
    entities
        .iter()
        .find(|e| e.display_name().eq_ignore_ascii_case(name))
}

/// Read access to the catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// All entities with their variants, in catalog order.
    async fn entities(&self) -> Result<Vec<Entity>>;

    async fn entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities()
            .await?
            .into_iter()
            .find(|e| e.id == entity_id))
    }
}

/// Catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    entities: Vec<Entity>,
}

impl MemoryCatalog {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn entities(&self) -> Result<Vec<Entity>> {
        Ok(self.entities.clone())
    }
}

/// Catalog stored as a JSON array of entities.
///
/// The file is re-read on every query so an external re-seed is picked up
/// without restarting.
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the catalog file atomically.
    pub fn write(&self, entities: &[Entity]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SkinCacheError::Catalog(format!("no parent for {}", self.path.display())))?;
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, entities)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for JsonFileCatalog {
    async fn entities(&self) -> Result<Vec<Entity>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            SkinCacheError::Catalog(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SkinCacheError::Catalog(format!("cannot parse {}: {e}", self.path.display()))
        })
    }
}
