//! Structured lifecycle events for update runs.
//!
//! Every event carries an `event` field (`run.started`, `pair.processed`, ...)
//! so JSON logs can be filtered without parsing messages.

use tracing::{info, warn};

use crate::error::SkinCacheError;

/// Span covering one update run; attach with [`tracing::Instrument`].
pub fn run_span(run_id: &str, mode: &'static str) -> tracing::Span {
    tracing::info_span!("skincache.run", run_id = %run_id, mode = mode)
}

pub fn emit_run_started(run_id: &str, version: &str, mode: &str) {
    info!(event = "run.started", run_id = %run_id, version = %version, mode = %mode);
}

pub fn emit_candidates_selected(run_id: &str, entity_id: Option<&str>, pairs: usize) {
    info!(
        event = "run.candidates",
        run_id = %run_id,
        entity = entity_id.unwrap_or("-"),
        pairs = pairs,
    );
}

pub fn emit_pair_processed(run_id: &str, entity_id: &str, variant_id: &str, digest: &str) {
    info!(
        event = "pair.processed",
        run_id = %run_id,
        entity = %entity_id,
        variant = %variant_id,
        digest = %digest,
    );
}

pub fn emit_pair_failed(run_id: &str, entity_id: &str, variant_id: &str, error: &SkinCacheError) {
    warn!(
        event = "pair.failed",
        run_id = %run_id,
        entity = %entity_id,
        variant = %variant_id,
        kind = error.kind(),
        error = %error,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, succeeded: usize, failed: usize, cancelled: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        succeeded = succeeded,
        failed = failed,
        cancelled = cancelled,
    );
}

pub fn emit_ledger_flushed(run_id: &str, records: usize) {
    info!(event = "ledger.flushed", run_id = %run_id, records = records);
}

pub fn emit_ledger_flush_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "ledger.flush_error", run_id = %run_id, error = %error);
}
