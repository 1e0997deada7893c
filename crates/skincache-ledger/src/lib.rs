//! skincache-ledger: durable freshness tracking for skin packages.
//!
//! The ledger maps a `(entity_id, variant_id)` pair to the content version it
//! was last built for and when. A pair is fresh for version `V` iff a record
//! exists and its version equals `V`.
//!
//! ## Layer 0 - Persistence
//!
//! Writes stay in memory until [`FreshnessLedger::flush`], which replaces the
//! ledger file atomically. A missing, empty or undecodable file loads as an
//! empty ledger.

pub mod error;
pub mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{FreshnessLedger, FreshnessRecord, PairKey};
