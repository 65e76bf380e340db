// Cache eviction integration tests
//
// A pass over real conversions deletes the oldest artifacts first and takes
// their metadata records with them.

use super::test_harness::{request, tree_size, FakeEncoder, TestEnv};
use picshift::eviction::{EvictionOrder, EvictionScheduler};
use picshift::metadata::artifact_id;
use std::fs::File;
use std::time::{Duration, SystemTime};

fn age(path: &std::path::Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(secs))
        .unwrap();
}

#[tokio::test]
async fn test_pass_evicts_oldest_artifact() {
    let env = TestEnv::new(|_| {});
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    for (name, secs) in [("old.jpg", 300), ("mid.jpg", 200), ("new.jpg", 100)] {
        env.write_source(name, b"some-jpeg-bytes");
        service
            .convert(&request(&format!("/{}", name), "image/webp"))
            .await
            .unwrap();
        age(&env.exhaust(&format!("webp/local/{}.webp", name)), secs);
    }

    let total = tree_size(&env.config.exhaust_path) + tree_size(&env.config.metadata_path);
    let scheduler = EvictionScheduler::new(
        &env.config.exhaust_path,
        &env.config.remote_raw_path,
        service.metadata(),
        service.backend(),
        service.locks(),
        total - 1,
        EvictionOrder::ModifiedTime,
    );

    let report = scheduler.run_once().await;

    assert_eq!(report.bytes_before, total);
    assert_eq!(report.files_deleted, 1);
    assert!(report.bytes_after < total);
    assert!(!env.exhaust("webp/local/old.jpg.webp").exists());
    assert!(env.exhaust("webp/local/mid.jpg.webp").is_file());
    assert!(env.exhaust("webp/local/new.jpg.webp").is_file());

    let old_id = artifact_id(std::path::Path::new("webp/local/old.jpg.webp"));
    assert!(service.metadata().lookup(&old_id).await.is_none());

    // Evicted artifact is rebuilt on demand
    service
        .convert(&request("/old.jpg", "image/webp"))
        .await
        .unwrap();
    assert_eq!(encoder.calls(), 4);
}

#[tokio::test]
async fn test_under_budget_deletes_nothing() {
    let env = TestEnv::new(|_| {});
    let service = env.service(FakeEncoder::new());
    env.write_source("a.jpg", b"jpeg");
    service
        .convert(&request("/a.jpg", "image/webp"))
        .await
        .unwrap();

    let scheduler = EvictionScheduler::new(
        &env.config.exhaust_path,
        &env.config.remote_raw_path,
        service.metadata(),
        service.backend(),
        service.locks(),
        u64::MAX,
        EvictionOrder::AccessTime,
    );
    let report = scheduler.run_once().await;

    assert_eq!(report.files_deleted, 0);
    assert_eq!(report.bytes_before, report.bytes_after);
    assert!(env.exhaust("webp/local/a.jpg.webp").is_file());
}

#[tokio::test]
async fn test_locked_artifact_survives() {
    let env = TestEnv::new(|_| {});
    let service = env.service(FakeEncoder::new());
    env.write_source("busy.jpg", b"jpeg");
    service
        .convert(&request("/busy.jpg", "image/webp"))
        .await
        .unwrap();

    let id = artifact_id(std::path::Path::new("webp/local/busy.jpg.webp"));
    let _guard = service.locks().try_acquire(&id).unwrap();

    let scheduler = EvictionScheduler::new(
        &env.config.exhaust_path,
        &env.config.remote_raw_path,
        service.metadata(),
        service.backend(),
        service.locks(),
        0,
        EvictionOrder::ModifiedTime,
    );
    let report = scheduler.run_once().await;

    assert_eq!(report.skipped_locked, 1);
    assert!(env.exhaust("webp/local/busy.jpg.webp").is_file());
}
