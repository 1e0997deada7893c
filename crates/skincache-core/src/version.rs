//! Upstream content version resolution.
//!
//! Every freshness comparison is made against the [`VersionTag`] returned by
//! a [`VersionOracle`] at the start of a run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SkinCacheError};

/// Normalized upstream version: the raw dotted version without its last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(String);

impl VersionTag {
    /// `"14.3.1"` and `"14.3.99"` both become `"14.3"`. A raw version without
    /// any dot is kept whole.
    pub fn normalize(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.rsplit_once('.') {
            Some((head, _micro)) => VersionTag(head.to_string()),
            None => VersionTag(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the current upstream version.
#[async_trait]
pub trait VersionOracle: Send + Sync {
    /// Fails with `UpstreamUnavailable` when the endpoint is unreachable or
    /// answers with something other than a non-empty list of versions.
    async fn current_version(&self) -> Result<VersionTag>;
}

/// Version oracle backed by the upstream `versions.json` endpoint.
pub struct HttpVersionOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpVersionOracle {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Newest raw (un-normalized) version string.
    pub async fn latest_raw(&self) -> Result<String> {
        let unavailable =
            |reason: String| SkinCacheError::UpstreamUnavailable(format!("{}: {reason}", self.url));

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("status {}", response.status())));
        }
        let versions: Vec<String> = response
            .json()
            .await
            .map_err(|e| unavailable(format!("malformed version list: {e}")))?;

        versions
            .into_iter()
            .next()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| unavailable("empty version list".to_string()))
    }
}

#[async_trait]
impl VersionOracle for HttpVersionOracle {
    async fn current_version(&self) -> Result<VersionTag> {
        let raw = self.latest_raw().await?;
        let tag = VersionTag::normalize(&raw);
        debug!(raw = %raw, version = %tag, "Resolved upstream version");
        Ok(tag)
    }
}

/// Fixed version, for offline operation and tests.
#[derive(Debug, Clone)]
pub struct PinnedVersion(VersionTag);

impl PinnedVersion {
    /// `version` is taken as already normalized.
    pub fn new(version: impl Into<String>) -> Self {
        PinnedVersion(VersionTag(version.into()))
    }
}

#[async_trait]
impl VersionOracle for PinnedVersion {
    async fn current_version(&self) -> Result<VersionTag> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micro_segment_is_dropped() {
        assert_eq!(VersionTag::normalize("14.3.1").as_str(), "14.3");
    }

    #[test]
    fn test_versions_differing_in_micro_compare_equal() {
        assert_eq!(VersionTag::normalize("14.3.1"), VersionTag::normalize("14.3.99"));
        assert_ne!(VersionTag::normalize("14.3.1"), VersionTag::normalize("14.4.1"));
    }

    #[test]
    fn test_two_digit_micro() {
        // A fixed-width suffix strip would get this wrong.
        assert_eq!(VersionTag::normalize("14.23.10").as_str(), "14.23");
    }

    #[test]
    fn test_undotted_version_kept() {
        assert_eq!(VersionTag::normalize(" lolpatch_7 ").as_str(), "lolpatch_7");
    }

    #[tokio::test]
    async fn test_pinned_version() {
        let oracle = PinnedVersion::new("14.3");
        assert_eq!(oracle.current_version().await.unwrap().as_str(), "14.3");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_upstream_unavailable() {
        let client = reqwest::Client::new();
        // Port 9 (discard) on localhost is not expected to serve HTTP.
        let oracle = HttpVersionOracle::new(client, "http://127.0.0.1:9/api/versions.json");
        let err = oracle.current_version().await.unwrap_err();
        assert!(matches!(err, SkinCacheError::UpstreamUnavailable(_)));
    }
}
