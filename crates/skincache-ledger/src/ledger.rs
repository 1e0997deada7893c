use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};

/// File magic so an unrelated blob at the ledger path is treated as corrupt.
const LEDGER_MAGIC: [u8; 4] = *b"SKLG";
const LEDGER_FORMAT: u16 = 1;

/// Identity of a tracked `(entity_id, variant_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub entity_id: String,
    pub variant_id: String,
}

impl PairKey {
    pub fn new(entity_id: impl Into<String>, variant_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            variant_id: variant_id.into(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.variant_id)
    }
}

/// Version a pair was last built for, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    magic: [u8; 4],
    format: u16,
    records: BTreeMap<PairKey, FreshnessRecord>,
}

/// Durable `(entity_id, variant_id) -> (version, timestamp)` map.
///
/// Mutation goes through an internal mutex, so one ledger can be shared by
/// reference between concurrently processed pairs.
#[derive(Debug)]
pub struct FreshnessLedger {
    path: PathBuf,
    records: Mutex<BTreeMap<PairKey, FreshnessRecord>>,
    /// Held for a whole flush so the newest snapshot is the one persisted last.
    flush_lock: Mutex<()>,
}

impl FreshnessLedger {
    /// Open the ledger stored at `path`.
    ///
    /// Never fails: an absent, empty or corrupt file yields an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = load_records(&path);
        info!(path = %path.display(), records = records.len(), "Freshness ledger loaded");
        Self {
            path,
            records: Mutex::new(records),
            flush_lock: Mutex::new(()),
        }
    }

    /// Path of the durable ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff a record exists for the pair and was written for `version`.
    pub fn is_fresh(&self, entity_id: &str, variant_id: &str, version: &str) -> bool {
        let key = PairKey::new(entity_id, variant_id);
        self.lock()
            .get(&key)
            .map(|record| record.version == version)
            .unwrap_or(false)
    }

    /// Upsert `(version, now)` for the pair. In memory until [`flush`](Self::flush).
    pub fn mark_fresh(&self, entity_id: &str, variant_id: &str, version: &str) {
        let key = PairKey::new(entity_id, variant_id);
        let record = FreshnessRecord {
            version: version.to_string(),
            updated_at: Utc::now(),
        };
        debug!(pair = %key, version = %version, "Marking pair fresh");
        self.lock().insert(key, record);
    }

    /// Current record for the pair, if any.
    pub fn record(&self, entity_id: &str, variant_id: &str) -> Option<FreshnessRecord> {
        self.lock().get(&PairKey::new(entity_id, variant_id)).cloned()
    }

    /// Copy of the full in-memory map.
    pub fn snapshot(&self) -> BTreeMap<PairKey, FreshnessRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Persist the full map, replacing the previous file atomically.
    ///
    /// The file is written to a temp file in the same directory and renamed
    /// over the old one, so readers see either the old or the new ledger.
    pub fn flush(&self) -> LedgerResult<()> {
        let _flushing = self
            .flush_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = LedgerFile {
            magic: LEDGER_MAGIC,
            format: LEDGER_FORMAT,
            records: self.snapshot(),
        };
        let bytes = codec().serialize(&file)?;

        let dir = self
            .path
            .parent()
            .ok_or_else(|| LedgerError::InvalidPath(self.path.display().to_string()))?;
        let persist_err = |source: std::io::Error| LedgerError::Persist {
            path: self.path.display().to_string(),
            source,
        };
        fs::create_dir_all(dir).map_err(persist_err)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(persist_err)?;
        tmp.write_all(&bytes).map_err(persist_err)?;
        tmp.as_file().sync_all().map_err(persist_err)?;
        tmp.persist(&self.path).map_err(|e| persist_err(e.error))?;

        debug!(path = %self.path.display(), records = file.records.len(), bytes = bytes.len(), "Ledger flushed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PairKey, FreshnessRecord>> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every critical section is a single insert or read.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(256 * 1024 * 1024)
}

fn load_records(path: &Path) -> BTreeMap<PairKey, FreshnessRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ledger unreadable, starting empty");
            return BTreeMap::new();
        }
    };

    if bytes.is_empty() {
        return BTreeMap::new();
    }

    match codec().deserialize::<LedgerFile>(&bytes) {
        Ok(file) if file.magic == LEDGER_MAGIC && file.format == LEDGER_FORMAT => file.records,
        Ok(file) => {
            warn!(
                path = %path.display(),
                format = file.format,
                "Ledger has unknown header, starting empty"
            );
            BTreeMap::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ledger corrupt, starting empty");
            BTreeMap::new()
        }
    }
}
