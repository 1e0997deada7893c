//! skincache core library.
//!
//! Keeps a local, versioned cache of per-entity skin packages built from a
//! remote content mirror. For every stale `(entity_id, variant_id)` pair the
//! pipeline fetches the raw payloads, decodes them with an external
//! converter, merges the variant against its entity's base document,
//! re-encodes it and archives the result. Successful pairs are recorded in the
//! freshness ledger so later runs skip them until the upstream version moves.
//!
//! Entry points are [`UpdateOrchestrator`] for batch runs, [`PackageLookup`]
//! for the serving path and [`SkinCache`] to wire both from configuration.

pub mod app;
pub mod archiver;
pub mod catalog;
pub mod config;
pub mod document;
pub mod error;
pub mod existence;
pub mod fetcher;
pub mod lookup;
pub mod merge;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod process;
pub mod resolver;
pub mod seed;
pub mod telemetry;
pub mod transcoder;
pub mod version;

pub use app::{Collaborators, SkinCache};
pub use archiver::{OutputPackage, PackageArchiver, PackageLayout};
pub use catalog::{
    entity_by_name, CatalogStore, Entity, JsonFileCatalog, MemoryCatalog, Variant, BASE_VARIANT_ID,
};
pub use config::{SkinCacheConfig, ToolConfig};
pub use document::StructuredDocument;
pub use error::{Result, SkinCacheError};
pub use existence::{build_worklist, ExistenceCheck, HttpExistenceCheck, WorkItem};
pub use fetcher::{AssetFetcher, StagedPair, StagedPayload};
pub use lookup::PackageLookup;
pub use merge::{merge_documents, MergeEngine};
pub use orchestrator::{
    select_candidates, Candidates, OrchestratorSettings, PairFailure, RunControl, RunReport,
    UpdateOrchestrator,
};
pub use pipeline::PairPipeline;
pub use resolver::{ListingResolver, MirrorDirectoryResolver};
pub use transcoder::{ExternalTranscoder, Transcoder};
pub use version::{HttpVersionOracle, PinnedVersion, VersionOracle, VersionTag};

pub use skincache_ledger::{FreshnessLedger, FreshnessRecord, PairKey};

/// Crate version, reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
