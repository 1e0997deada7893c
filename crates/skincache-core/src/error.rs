//! Error taxonomy for the skin update pipeline.
//!
//! Failures before a batch starts (`UpstreamUnavailable` while resolving the
//! version, `RunInProgress`) abort the run. Everything else is scoped to one
//! `(entity_id, variant_id)` pair and is caught at the pair boundary.

use skincache_ledger::LedgerError;

/// skincache errors.
#[derive(Debug, thiserror::Error)]
pub enum SkinCacheError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("no mirror directory found for entity {entity_id} (code {code})")]
    DirectoryNotFound { entity_id: String, code: String },

    #[error("fetch failed for {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("transcode failed for {path} (exit code {exit_code}): {diagnostics}")]
    TranscodeFailed {
        path: String,
        exit_code: i32,
        diagnostics: String,
    },

    #[error("transcode timed out for {path} after {timeout_secs}s")]
    TranscodeTimeout { path: String, timeout_secs: u64 },

    #[error("malformed document {path}: {reason}")]
    MalformedDocument { path: String, reason: String },

    #[error("variant payload missing after fetch: {0}")]
    PayloadMissing(String),

    #[error("archive failed for {pair}: {reason}")]
    ArchiveFailed { pair: String, reason: String },

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("variant {variant_id} not found for entity {entity_id}")]
    VariantNotFound {
        entity_id: String,
        variant_id: String,
    },

    #[error("base variant of entity {0} is not packaged on its own")]
    BaseVariantRequested(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("an update run is already in progress")]
    RunInProgress,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SkinCacheError {
    /// Short stable label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SkinCacheError::UpstreamUnavailable(_) => "upstream_unavailable",
            SkinCacheError::DirectoryNotFound { .. } => "directory_not_found",
            SkinCacheError::FetchFailed { .. } => "fetch_failed",
            SkinCacheError::TranscodeFailed { .. } => "transcode_failed",
            SkinCacheError::TranscodeTimeout { .. } => "transcode_timeout",
            SkinCacheError::MalformedDocument { .. } => "malformed_document",
            SkinCacheError::PayloadMissing(_) => "payload_missing",
            SkinCacheError::ArchiveFailed { .. } => "archive_failed",
            SkinCacheError::EntityNotFound(_) => "entity_not_found",
            SkinCacheError::VariantNotFound { .. } => "variant_not_found",
            SkinCacheError::BaseVariantRequested(_) => "base_variant_requested",
            SkinCacheError::Catalog(_) => "catalog",
            SkinCacheError::RunInProgress => "run_in_progress",
            SkinCacheError::Config(_) => "config",
            SkinCacheError::Ledger(_) => "ledger",
            SkinCacheError::Serialization(_) => "serialization",
            SkinCacheError::Io(_) => "io",
            SkinCacheError::Task(_) => "task",
        }
    }
}

/// Result type for skincache operations.
pub type Result<T> = std::result::Result<T, SkinCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_not_found_display() {
        let err = SkinCacheError::DirectoryNotFound {
            entity_id: "22".to_string(),
            code: "Ashe".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("22"));
        assert!(msg.contains("Ashe"));
        assert_eq!(err.kind(), "directory_not_found");
    }

    #[test]
    fn test_transcode_failed_surfaces_diagnostics() {
        let err = SkinCacheError::TranscodeFailed {
            path: "/tmp/skin1.bin".to_string(),
            exit_code: 2,
            diagnostics: "unknown hash 0xdeadbeef".to_string(),
        };
        assert!(err.to_string().contains("unknown hash 0xdeadbeef"));
    }

    #[test]
    fn test_io_error_converts() {
        let err: SkinCacheError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("disk full"));
    }
}
