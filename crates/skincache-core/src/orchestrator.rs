//! Update orchestration.
//!
//! A batch run is `ResolveVersion -> SelectCandidates -> ProcessPair* -> FlushLedger`.
//! Only failures before the first pair (version resolution, catalog read,
//! another run in progress) abort a run. Pair failures are recorded in the
//! [`RunReport`] and leave the pair's ledger record untouched, and the ledger
//! is flushed whatever happened to the pairs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use skincache_ledger::FreshnessLedger;
use tokio::sync::Mutex;
use tracing::{info, Instrument};

use crate::archiver::OutputPackage;
use crate::catalog::{entity_by_name, CatalogStore, Entity, Variant};
use crate::error::{Result, SkinCacheError};
use crate::existence::WorkItem;
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::PairPipeline;
use crate::version::{VersionOracle, VersionTag};

pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Max pairs taken from the selected entity per run; 0 means no cap.
    pub per_entity_cap: usize,
    /// Pairs of one entity processed concurrently.
    pub workers: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            per_entity_cap: 10,
            workers: 2,
        }
    }
}

impl OrchestratorSettings {
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }
}

/// Cooperative cancellation, checked before each pair starts.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairFailure {
    pub entity_id: String,
    pub variant_id: String,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub version: String,
    /// Entity selected by a batch run; `None` for worklist runs and idle runs.
    pub entity_id: Option<String>,
    pub succeeded: Vec<OutputPackage>,
    pub failed: Vec<PairFailure>,
    /// Worklist items already fresh for this version.
    pub skipped: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_idle(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

/// Stale variants chosen for one run, all from the same entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    pub entity: Entity,
    pub variants: Vec<Variant>,
}

/// The first entity (catalog order) with a stale tracked variant, with at
/// most `cap` of its stale variants (all of them when `cap` is 0).
pub fn select_candidates(
    entities: &[Entity],
    ledger: &FreshnessLedger,
    version: &VersionTag,
    cap: usize,
) -> Option<Candidates> {
    entities.iter().find_map(|entity| {
        let stale = entity
            .tracked_variants()
            .filter(|v| !ledger.is_fresh(&entity.id, &v.id, version.as_str()));
        let variants: Vec<Variant> = if cap == 0 {
            stale.cloned().collect()
        } else {
            stale.take(cap).cloned().collect()
        };
        (!variants.is_empty()).then(|| Candidates {
            entity: entity.clone(),
            variants,
        })
    })
}

#[derive(Default)]
struct BatchOutcome {
    succeeded: Vec<OutputPackage>,
    failed: Vec<PairFailure>,
    cancelled: bool,
}

impl BatchOutcome {
    fn absorb(&mut self, other: BatchOutcome) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.cancelled |= other.cancelled;
    }
}

pub struct UpdateOrchestrator {
    oracle: Arc<dyn VersionOracle>,
    catalog: Arc<dyn CatalogStore>,
    ledger: Arc<FreshnessLedger>,
    pipeline: Arc<PairPipeline>,
    settings: OrchestratorSettings,
    run_guard: Mutex<()>,
}

impl UpdateOrchestrator {
    pub fn new(
        oracle: Arc<dyn VersionOracle>,
        catalog: Arc<dyn CatalogStore>,
        ledger: Arc<FreshnessLedger>,
        pipeline: Arc<PairPipeline>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            oracle,
            catalog,
            ledger,
            pipeline,
            settings,
            run_guard: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> OrchestratorSettings {
        self.settings
    }

    pub fn ledger(&self) -> &Arc<FreshnessLedger> {
        &self.ledger
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    /// One batch run over the first entity with stale variants.
    pub async fn run(&self, control: &RunControl) -> Result<RunReport> {
        let _guard = self.acquire()?;
        let run_id = new_run_id();
        self.run_batch(&run_id, control)
            .instrument(obs::run_span(&run_id, "batch"))
            .await
    }

    /// Process a caller-supplied worklist instead of selecting candidates.
    pub async fn run_worklist(&self, items: Vec<WorkItem>, control: &RunControl) -> Result<RunReport> {
        let _guard = self.acquire()?;
        let run_id = new_run_id();
        self.run_items(&run_id, items, control)
            .instrument(obs::run_span(&run_id, "worklist"))
            .await
    }

    fn acquire(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.run_guard.try_lock().map_err(|_| {
            METRICS.inc_runs_skipped();
            info!(event = "run.skipped", "Update run already in progress");
            SkinCacheError::RunInProgress
        })
    }

    async fn run_batch(&self, run_id: &str, control: &RunControl) -> Result<RunReport> {
        let start = Instant::now();
        let version = self.oracle.current_version().await?;
        obs::emit_run_started(run_id, version.as_str(), "batch");
        self.pipeline.prune_stale_versions(&version).await;
        let entities = self.catalog.entities().await?;

        let candidates = select_candidates(&entities, &self.ledger, &version, self.settings.per_entity_cap);
        obs::emit_candidates_selected(
            run_id,
            candidates.as_ref().map(|c| c.entity.id.as_str()),
            candidates.as_ref().map_or(0, |c| c.variants.len()),
        );

        let (entity_id, outcome) = match candidates {
            Some(Candidates { entity, variants }) => {
                let outcome = self.process_entity(run_id, &version, &entity, variants, control).await;
                self.pipeline.release_entity(&version, &entity.id).await;
                (Some(entity.id), outcome)
            }
            None => (None, BatchOutcome::default()),
        };

        self.finish(run_id, version, entity_id, outcome, 0, start).await
    }

    async fn run_items(&self, run_id: &str, items: Vec<WorkItem>, control: &RunControl) -> Result<RunReport> {
        let start = Instant::now();
        let version = self.oracle.current_version().await?;
        obs::emit_run_started(run_id, version.as_str(), "worklist");
        self.pipeline.prune_stale_versions(&version).await;
        let entities = self.catalog.entities().await?;

        let mut outcome = BatchOutcome::default();
        let mut skipped = 0;
        let mut groups: Vec<(Entity, Vec<Variant>)> = Vec::new();

        for item in &items {
            let (entity, variant) = match resolve_item(&entities, item) {
                Ok(pair) => pair,
                Err(e) => {
                    obs::emit_pair_failed(run_id, &item.entity_name, &item.variant_name, &e);
                    METRICS.inc_pairs_failed();
                    outcome.failed.push(failure(&item.entity_name, &item.variant_name, &e));
                    continue;
                }
            };
            if self.ledger.is_fresh(&entity.id, &variant.id, version.as_str()) {
                skipped += 1;
                continue;
            }
            match groups.iter_mut().find(|(e, _)| e.id == entity.id) {
                Some((_, variants)) if variants.contains(variant) => {}
                Some((_, variants)) => variants.push(variant.clone()),
                None => groups.push((entity.clone(), vec![variant.clone()])),
            }
        }
        obs::emit_candidates_selected(run_id, None, groups.iter().map(|(_, v)| v.len()).sum());

        for (entity, variants) in groups {
            if control.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let batch = self.process_entity(run_id, &version, &entity, variants, control).await;
            self.pipeline.release_entity(&version, &entity.id).await;
            outcome.absorb(batch);
        }

        self.finish(run_id, version, None, outcome, skipped, start).await
    }

    /// Run the pipeline for `variants` of one entity, up to `workers` at a time.
    async fn process_entity(
        &self,
        run_id: &str,
        version: &VersionTag,
        entity: &Entity,
        variants: Vec<Variant>,
        control: &RunControl,
    ) -> BatchOutcome {
        let results: Vec<Option<(Variant, Result<OutputPackage>)>> = stream::iter(variants)
            .map(move |variant| async move {
                if control.is_cancelled() {
                    return None;
                }
                let result = self.pipeline.process(version, entity, &variant).await;
                if result.is_ok() {
                    self.ledger.mark_fresh(&entity.id, &variant.id, version.as_str());
                }
                Some((variant, result))
            })
            .buffer_unordered(self.settings.effective_workers())
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for result in results {
            match result {
                None => outcome.cancelled = true,
                Some((variant, Ok(package))) => {
                    obs::emit_pair_processed(run_id, &entity.id, &variant.id, &package.digest);
                    METRICS.inc_pairs_processed();
                    outcome.succeeded.push(package);
                }
                Some((variant, Err(e))) => {
                    obs::emit_pair_failed(run_id, &entity.id, &variant.id, &e);
                    METRICS.inc_pairs_failed();
                    outcome.failed.push(failure(&entity.id, &variant.id, &e));
                }
            }
        }
        outcome.succeeded.sort_by(|a, b| numeric_cmp(&a.variant_id, &b.variant_id));
        outcome.failed.sort_by(|a, b| numeric_cmp(&a.variant_id, &b.variant_id));
        outcome
    }

    async fn finish(
        &self,
        run_id: &str,
        version: VersionTag,
        entity_id: Option<String>,
        outcome: BatchOutcome,
        skipped: usize,
        start: Instant,
    ) -> Result<RunReport> {
        if let Err(e) = flush_ledger(&self.ledger).await {
            obs::emit_ledger_flush_error(run_id, &e);
            return Err(e);
        }
        obs::emit_ledger_flushed(run_id, self.ledger.len());

        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_run_finished(
            run_id,
            duration_ms,
            outcome.succeeded.len(),
            outcome.failed.len(),
            outcome.cancelled,
        );
        METRICS.inc_runs_completed();
        METRICS.flush();

        Ok(RunReport {
            run_id: run_id.to_string(),
            version: version.as_str().to_string(),
            entity_id,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            skipped,
            cancelled: outcome.cancelled,
            duration_ms,
        })
    }
}

/// Persist `ledger` on the blocking pool; a flush writes and syncs a file.
pub(crate) async fn flush_ledger(ledger: &Arc<FreshnessLedger>) -> Result<()> {
    let ledger = Arc::clone(ledger);
    tokio::task::spawn_blocking(move || ledger.flush()).await??;
    Ok(())
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn failure(entity_id: &str, variant_id: &str, error: &SkinCacheError) -> PairFailure {
    PairFailure {
        entity_id: entity_id.to_string(),
        variant_id: variant_id.to_string(),
        kind: error.kind().to_string(),
        error: error.to_string(),
    }
}

fn resolve_item<'a>(entities: &'a [Entity], item: &WorkItem) -> Result<(&'a Entity, &'a Variant)> {
    let entity = entity_by_name(entities, &item.entity_name)
        .ok_or_else(|| SkinCacheError::EntityNotFound(item.entity_name.clone()))?;
    let variant = entity
        .variant_by_name(&item.variant_name)
        .ok_or_else(|| SkinCacheError::VariantNotFound {
            entity_id: entity.id.clone(),
            variant_id: item.variant_name.clone(),
        })?;
    if variant.is_base() {
        return Err(SkinCacheError::BaseVariantRequested(entity.id.clone()));
    }
    Ok((entity, variant))
}

fn numeric_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
