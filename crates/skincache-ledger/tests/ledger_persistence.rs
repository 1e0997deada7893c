//! Persistence contract tests for the freshness ledger.

use std::sync::Arc;

use skincache_ledger::{FreshnessLedger, PairKey};

/// Test: a flushed ledger reloads to an equal map
#[test]
fn test_flush_then_reload_yields_equal_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.bin");

    let ledger = FreshnessLedger::open(&path);
    ledger.mark_fresh("22", "1", "14.3");
    ledger.mark_fresh("22", "2", "14.3");
    ledger.mark_fresh("103", "15", "14.2");
    let before = ledger.snapshot();
    ledger.flush().unwrap();

    let reloaded = FreshnessLedger::open(&path);
    assert_eq!(reloaded.snapshot(), before);
    assert!(reloaded.is_fresh("22", "1", "14.3"));
    assert!(reloaded.is_fresh("103", "15", "14.2"));
}

/// Test: a later flush replaces the file written by an earlier one
#[test]
fn test_flush_overwrites_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.bin");

    let first = FreshnessLedger::open(&path);
    first.mark_fresh("22", "1", "14.2");
    first.flush().unwrap();

    let second = FreshnessLedger::open(&path);
    second.mark_fresh("22", "1", "14.3");
    second.flush().unwrap();

    let reloaded = FreshnessLedger::open(&path);
    assert_eq!(reloaded.record("22", "1").unwrap().version, "14.3");
    assert_eq!(reloaded.len(), 1);
}

/// Test: a truncated ledger file opens as an empty ledger
#[test]
fn test_truncated_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.bin");

    let ledger = FreshnessLedger::open(&path);
    for variant in 1..20 {
        ledger.mark_fresh("22", &variant.to_string(), "14.3");
    }
    ledger.flush().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    assert!(FreshnessLedger::open(&path).is_empty());
}

/// Test: marks from many threads are all recorded and persisted
#[test]
fn test_concurrent_marks_are_all_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(FreshnessLedger::open(dir.path().join("ledger.bin")));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                for variant in 0..50 {
                    ledger.mark_fresh(&worker.to_string(), &variant.to_string(), "14.3");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ledger.len(), 8 * 50);
    ledger.flush().unwrap();
    let reloaded = FreshnessLedger::open(ledger.path());
    assert_eq!(reloaded.len(), 8 * 50);
    assert!(reloaded
        .snapshot()
        .contains_key(&PairKey::new("7", "49")));
}
