//! Structured (decoded) form of a skin payload.
//!
//! The converter emits a nested object whose top-level entries live at
//! `entries.value.items`: an ordered array of `{ "key": .., "value": { "name": .., .. } }`.
//! The first item's key is the skin's canonical title; at most one item has
//! `value.name == "ResourceResolver"`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SkinCacheError};

pub const RESOURCE_RESOLVER: &str = "ResourceResolver";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredDocument(Value);

impl StructuredDocument {
    pub fn from_value(value: Value) -> Self {
        StructuredDocument(value)
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| SkinCacheError::MalformedDocument {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(StructuredDocument(value))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.0)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub fn items(&self) -> Option<&Vec<Value>> {
        self.0.get("entries")?.get("value")?.get("items")?.as_array()
    }

    pub fn items_mut(&mut self) -> Option<&mut Vec<Value>> {
        self.0
            .get_mut("entries")?
            .get_mut("value")?
            .get_mut("items")?
            .as_array_mut()
    }

    /// Key of the first item.
    pub fn title_key(&self) -> Option<&Value> {
        self.items()?.first()?.get("key")
    }

    /// Index of the ResourceResolver item: the last item if it is one,
    /// otherwise the first matching item in order.
    pub fn resource_resolver_index(&self) -> Option<usize> {
        resource_resolver_index(self.items()?)
    }

    pub fn resource_resolver_key(&self) -> Option<&Value> {
        let index = self.resource_resolver_index()?;
        self.items()?.get(index)?.get("key")
    }
}

pub(crate) fn resource_resolver_index(items: &[Value]) -> Option<usize> {
    let is_resolver = |item: &Value| {
        item.get("value")
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            == Some(RESOURCE_RESOLVER)
    };

    match items.last() {
        Some(last) if is_resolver(last) => Some(items.len() - 1),
        _ => items.iter().position(is_resolver),
    }
}
