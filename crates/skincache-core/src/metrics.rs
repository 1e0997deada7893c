//! Process-wide pipeline counters.
//!
//! Incremented at the call site; [`Metrics::flush`] logs all of them as one
//! `info!` event at the end of a run or daemon tick.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pairs_processed: AtomicU64,
    pairs_failed: AtomicU64,
    runs_completed: AtomicU64,
    runs_skipped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            pairs_processed: AtomicU64::new(0),
            pairs_failed: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_skipped: AtomicU64::new(0),
        }
    }

    pub fn inc_pairs_processed(&self) {
        self.pairs_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pairs_failed(&self) {
        self.pairs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A trigger found another run in progress.
    pub fn inc_runs_skipped(&self) {
        self.runs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            pairs_processed = self.pairs_processed(),
            pairs_failed = self.pairs_failed(),
            runs_completed = self.runs_completed(),
            runs_skipped = self.runs_skipped(),
        );
    }

    pub fn pairs_processed(&self) -> u64 {
        self.pairs_processed.load(Ordering::Relaxed)
    }

    pub fn pairs_failed(&self) -> u64 {
        self.pairs_failed.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn runs_skipped(&self) -> u64 {
        self.runs_skipped.load(Ordering::Relaxed)
    }
}
