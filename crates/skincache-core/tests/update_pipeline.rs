//! End-to-end batch runs against an in-process mirror.

#![cfg(unix)]

mod support;

use std::time::Duration;

use serde_json::json;
use skincache_core::{RunControl, SkinCacheError};
use support::{ashe_mirror, entity, variant_doc, Fixture, MirrorServer};

/// Test: the two non-base variants of entity 22 are built and recorded for 14.3
#[tokio::test]
async fn test_stale_variants_are_built_and_recorded() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();

    let report = cache
        .orchestrator()
        .run(&RunControl::new())
        .await
        .expect("run failed");

    assert_eq!(report.version, "14.3");
    assert_eq!(report.entity_id.as_deref(), Some("22"));
    assert!(report.failed.is_empty(), "unexpected failures: {:?}", report.failed);
    let built: Vec<&str> = report.succeeded.iter().map(|p| p.variant_id.as_str()).collect();
    assert_eq!(built, vec!["1", "2"]);

    assert!(fx.package_path("22", "1").exists());
    assert!(fx.package_path("22", "2").exists());
    assert!(!fx.package_path("22", "0").exists(), "base variant is never packaged");

    let ledger = cache.ledger();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.record("22", "1").expect("record").version, "14.3");
    assert_eq!(ledger.record("22", "2").expect("record").version, "14.3");
    assert!(ledger.record("22", "0").is_none());

    // Base payload is downloaded once and shared by both variants.
    assert_eq!(fx.mirror.hits(&MirrorServer::payload_path("14.3", "ashe", "0")), 1);
}

/// Test: the shipped payload carries the base title and resolver keys
#[tokio::test]
async fn test_shipped_payload_is_merged_against_base() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    fx.open().orchestrator().run(&RunControl::new()).await.expect("run failed");

    for variant in ["1", "2"] {
        let doc = fx.shipped_doc("14.3", "22", variant, "ashe");
        let items = doc["entries"]["value"]["items"].as_array().expect("items");
        assert_eq!(items[0]["key"], json!("Characters/Ashe/Skins/Skin0"));
        assert_eq!(items[2]["key"], json!("Characters/Ashe/Skins/Skin0/Resources"));
        // Variant content survives.
        assert_eq!(items[1]["key"], json!(format!("vfx-{variant}")));
    }
}

/// Test: a second run with no upstream change does nothing
#[tokio::test]
async fn test_second_run_is_idle() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();
    cache.orchestrator().run(&RunControl::new()).await.expect("first run");
    let payload_hits = fx.mirror.hits(&MirrorServer::payload_path("14.3", "ashe", "1"));

    let second = cache.orchestrator().run(&RunControl::new()).await.expect("second run");
    assert!(second.is_idle());
    assert_eq!(second.entity_id, None);
    assert_eq!(
        fx.mirror.hits(&MirrorServer::payload_path("14.3", "ashe", "1")),
        payload_hits
    );
}

/// Test: ledger state survives a restart, so a reopened instance is idle too
#[tokio::test]
async fn test_ledger_survives_restart() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    fx.open().orchestrator().run(&RunControl::new()).await.expect("first run");

    let reopened = fx.open();
    assert_eq!(reopened.ledger().len(), 2);
    let report = reopened.orchestrator().run(&RunControl::new()).await.expect("second run");
    assert!(report.is_idle());
}

/// Test: a new upstream micro version does not invalidate anything
#[tokio::test]
async fn test_micro_version_bump_keeps_pairs_fresh() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();
    cache.orchestrator().run(&RunControl::new()).await.expect("first run");

    fx.mirror.serve_versions(&["14.3.99", "14.3.1"]);
    let report = cache.orchestrator().run(&RunControl::new()).await.expect("second run");
    assert!(report.is_idle());
}

/// Test: a malformed variant fails alone; its sibling is built and recorded
#[tokio::test]
async fn test_pair_failure_is_isolated() {
    let mirror = ashe_mirror().await;
    mirror.serve(&MirrorServer::payload_path("14.3", "ashe", "1"), "not a document");
    let fx = Fixture::new(mirror, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();

    let report = cache.orchestrator().run(&RunControl::new()).await.expect("run failed");

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].variant_id, "2");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].variant_id, "1");
    assert_eq!(report.failed[0].kind, "malformed_document");

    assert!(cache.ledger().record("22", "1").is_none());
    assert!(cache.ledger().record("22", "2").is_some());
    assert!(!fx.package_path("22", "1").exists());
    assert!(fx.package_path("22", "2").exists());

    // The failure was flushed around, not through: a restart sees variant 2 only.
    assert_eq!(fx.open().ledger().len(), 1);
}

/// Test: a missing variant payload fails only that pair and is retried next run
#[tokio::test]
async fn test_missing_payload_is_retried() {
    let mirror = ashe_mirror().await;
    mirror.fail(&MirrorServer::payload_path("14.3", "ashe", "2"), 404);
    let fx = Fixture::new(mirror, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();

    let first = cache.orchestrator().run(&RunControl::new()).await.expect("first run");
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].kind, "fetch_failed");

    fx.mirror.serve_payload("14.3", "ashe", "2", &variant_doc("ashe", "2"));
    let second = cache.orchestrator().run(&RunControl::new()).await.expect("second run");
    let built: Vec<&str> = second.succeeded.iter().map(|p| p.variant_id.as_str()).collect();
    assert_eq!(built, vec!["2"]);
}

/// Test: an entity absent from the mirror listing fails with directory_not_found
#[tokio::test]
async fn test_unknown_mirror_directory() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("99", "zed", &["0", "1"])]);
    let report = fx.open().orchestrator().run(&RunControl::new()).await.expect("run failed");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].kind, "directory_not_found");
}

/// Test: only the first entity with stale variants is processed per run
#[tokio::test]
async fn test_one_entity_per_run() {
    let mirror = ashe_mirror().await;
    mirror.serve_listing("14.3", &["annie", "ashe"]);
    mirror.serve_payload("14.3", "annie", "0", &support::base_doc("Annie"));
    mirror.serve_payload("14.3", "annie", "1", &variant_doc("Annie", "1"));
    let fx = Fixture::new(
        mirror,
        vec![entity("1", "annie", &["0", "1"]), entity("22", "ashe", &["0", "1", "2"])],
    );
    let cache = fx.open();

    let first = cache.orchestrator().run(&RunControl::new()).await.expect("first run");
    assert_eq!(first.entity_id.as_deref(), Some("1"));
    assert!(!fx.package_path("22", "1").exists());

    let second = cache.orchestrator().run(&RunControl::new()).await.expect("second run");
    assert_eq!(second.entity_id.as_deref(), Some("22"));
    assert_eq!(second.succeeded.len(), 2);
}

/// Test: the per-entity cap bounds a run, later runs pick up the rest
#[tokio::test]
async fn test_cap_bounds_each_run() {
    let mirror = ashe_mirror().await;
    mirror.serve_payload("14.3", "ashe", "3", &variant_doc("Ashe", "3"));
    let mut fx = Fixture::new(mirror, vec![entity("22", "ashe", &["0", "1", "2", "3"])]);
    fx.config.per_entity_cap = 2;
    let cache = fx.open();

    let first = cache.orchestrator().run(&RunControl::new()).await.expect("first run");
    assert_eq!(first.succeeded.len(), 2);
    let second = cache.orchestrator().run(&RunControl::new()).await.expect("second run");
    let built: Vec<&str> = second.succeeded.iter().map(|p| p.variant_id.as_str()).collect();
    assert_eq!(built, vec!["3"]);
}

/// Test: a cancelled run starts no pairs but still flushes the ledger
#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();
    let control = RunControl::new();
    control.cancel();

    let report = cache.orchestrator().run(&control).await.expect("run failed");
    assert!(report.cancelled);
    assert!(report.succeeded.is_empty());
    assert!(cache.ledger().path().exists(), "ledger is flushed even when cancelled");
}

/// Test: cancelling mid-run lets the running pair finish and starts no further pair
#[tokio::test]
async fn test_cancel_during_run_keeps_finished_pair() {
    let mirror = ashe_mirror().await;
    mirror.serve_slowly(
        &MirrorServer::payload_path("14.3", "ashe", "1"),
        serde_json::to_vec(&variant_doc("Ashe", "1")).unwrap(),
        Duration::from_millis(500),
    );
    let mut fx = Fixture::new(mirror, vec![entity("22", "ashe", &["0", "1", "2"])]);
    fx.config.workers = 1;
    let cache = fx.open();
    let control = RunControl::new();

    let (report, ()) = tokio::join!(cache.orchestrator().run(&control), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        control.cancel();
    });
    let report = report.expect("run failed");

    assert!(report.cancelled);
    let built: Vec<&str> = report.succeeded.iter().map(|p| p.variant_id.as_str()).collect();
    assert_eq!(built, vec!["1"]);
    assert!(report.failed.is_empty());
    assert_eq!(fx.mirror.hits(&MirrorServer::payload_path("14.3", "ashe", "2")), 0);
    assert!(fx.package_path("22", "1").exists());
    assert!(!fx.package_path("22", "2").exists());

    assert!(cache.ledger().record("22", "1").is_some());
    assert!(cache.ledger().record("22", "2").is_none());
    let reopened = fx.open();
    assert_eq!(reopened.ledger().record("22", "1").expect("flushed").version, "14.3");
    assert!(reopened.ledger().record("22", "2").is_none());
    // Entity staging is released after its batch.
    assert!(!fx.config.staging_dir().join("14.3/22").exists());
}

/// Test: a finished run leaves only the current version's staging root
#[tokio::test]
async fn test_run_releases_entity_staging() {
    let fx = Fixture::new(ashe_mirror().await, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let stale = fx.config.staging_dir().join("14.2/22/1");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("skin0.bin"), b"stale").unwrap();

    fx.open().orchestrator().run(&RunControl::new()).await.expect("run failed");
    assert!(!fx.config.staging_dir().join("14.2").exists());
    assert!(!fx.config.staging_dir().join("14.3/22").exists());
}

/// Test: an overlapping run is refused while the first holds the run guard
#[tokio::test]
async fn test_overlapping_run_is_refused() {
    let mirror = ashe_mirror().await;
    mirror.serve_slowly(
        &MirrorServer::payload_path("14.3", "ashe", "1"),
        serde_json::to_vec(&variant_doc("Ashe", "1")).unwrap(),
        Duration::from_millis(500),
    );
    let fx = Fixture::new(mirror, vec![entity("22", "ashe", &["0", "1", "2"])]);
    let cache = fx.open();
    let orchestrator = cache.orchestrator();

    let control = RunControl::new();
    let (first, second) = tokio::join!(orchestrator.run(&control), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.run(&control).await
    });

    assert!(first.is_ok());
    assert!(matches!(second, Err(SkinCacheError::RunInProgress)));
    assert!(!orchestrator.is_running());
}

/// Test: an unreachable version endpoint aborts the run before any pair
#[tokio::test]
async fn test_version_endpoint_down_aborts_run() {
    let mirror = ashe_mirror().await;
    mirror.fail("/api/versions.json", 503);
    let fx = Fixture::new(mirror, vec![entity("22", "ashe", &["0", "1", "2"])]);

    let err = fx.open().orchestrator().run(&RunControl::new()).await.unwrap_err();
    assert!(matches!(err, SkinCacheError::UpstreamUnavailable(_)));
    assert_eq!(fx.mirror.hits(&MirrorServer::payload_path("14.3", "ashe", "1")), 0);
}
