// Image map and proxy integration tests
//
// Mapped prefixes pull sources from another directory or a remote origin;
// remote copies are reused within the cache TTL.

use super::test_harness::{request, spawn_origin, FakeEncoder, TestEnv};
use picshift::config::Config;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;

#[test]
fn test_invalid_map_entries_dropped() {
    let yaml = r#"
img_map:
  /cdn: "https://cdn.example.com/assets"
  /local: "/srv/other"
  /ftp: "ftp://files.example.com"
  nope: "https://x.example.com"
  "https://tenant.example.com/pics": "/srv/tenant"
  "ftp://tenant.example.com": "/srv/tenant"
"#;
    let config = Config::from_yaml_with_env(yaml).unwrap();

    assert_eq!(config.img_map.len(), 3);
    assert_eq!(
        config.img_map["https://tenant.example.com/pics"],
        "/srv/tenant"
    );
    assert_eq!(config.img_map["/cdn"], "https://cdn.example.com/assets");
    assert_eq!(config.img_map["/local"], "/srv/other");
}

#[tokio::test]
async fn test_remote_mapped_source() {
    let mut files = HashMap::new();
    files.insert("/assets/cat.jpg".to_string(), b"remote-jpeg".to_vec());
    let origin = spawn_origin(files).await;

    let base = origin.url("/assets");
    let env = TestEnv::new(move |c| {
        c.img_map = BTreeMap::from([("/cdn".to_string(), base)]);
    });
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    let first = service
        .convert(&request("/cdn/cat.jpg", "image/webp"))
        .await
        .unwrap();
    let second = service
        .convert(&request("/cdn/cat.jpg", "image/webp"))
        .await
        .unwrap();

    assert_eq!(&first.body[..], b"webpremote-jpeg");
    assert_eq!(first.body, second.body);
    assert_eq!(encoder.calls(), 1);
    // Second request trusted the local copy
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    let alias = format!("127.0.0.1_{}", origin.addr.port());
    assert!(env
        .exhaust(&format!("webp/{}/cdn/cat.jpg.webp", alias))
        .is_file());
}

#[tokio::test]
async fn test_remote_missing_is_not_found() {
    let origin = spawn_origin(HashMap::new()).await;
    let base = origin.url("");
    let env = TestEnv::new(move |c| c.proxy = Some(base));
    let service = env.service(FakeEncoder::new());

    let err = service
        .convert(&request("/gone.jpg", "image/webp"))
        .await
        .unwrap_err();

    assert_eq!(err.to_http_status(), 404);
}

#[tokio::test]
async fn test_proxy_mode_fetches_from_origin() {
    let mut files = HashMap::new();
    files.insert("/p/dog.png".to_string(), b"remote-png".to_vec());
    let origin = spawn_origin(files).await;
    let base = origin.url("");
    let env = TestEnv::new(move |c| c.proxy = Some(base));
    let service = env.service(FakeEncoder::new());

    let response = service
        .convert(&request("/p/dog.png", "image/png"))
        .await
        .unwrap();

    assert_eq!(&response.body[..], b"remote-png");
    assert_eq!(response.content_type, "image/png");
}

#[tokio::test]
async fn test_unreachable_origin_is_bad_gateway() {
    // Bind then drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let env = TestEnv::new(move |c| c.proxy = Some(base));
    let service = env.service(FakeEncoder::new());

    let err = service
        .convert(&request("/x.jpg", "image/webp"))
        .await
        .unwrap_err();

    assert_eq!(err.to_http_status(), 502);
}

#[tokio::test]
async fn test_local_mapped_directory() {
    let env = TestEnv::new(|c| {
        let other = c.image_path.with_file_name("other");
        c.img_map = BTreeMap::from([(
            "/static".to_string(),
            other.to_string_lossy().to_string(),
        )]);
    });
    let other = env.dir.path().join("other");
    std::fs::create_dir_all(&other).unwrap();
    std::fs::write(other.join("cat.jpg"), b"mapped-jpeg").unwrap();
    let service = env.service(FakeEncoder::new());

    let response = service
        .convert(&request("/static/cat.jpg", "image/webp"))
        .await
        .unwrap();

    assert_eq!(&response.body[..], b"webpmapped-jpeg");
}

#[tokio::test]
async fn test_host_scoped_remote_mapping() {
    let mut files = HashMap::new();
    files.insert("/tenant/cat.jpg".to_string(), b"tenant-jpeg".to_vec());
    let origin = spawn_origin(files).await;

    let base = origin.url("/tenant");
    let env = TestEnv::new(move |c| {
        c.img_map = BTreeMap::from([("http://shop.example.com/".to_string(), base)]);
    });
    env.write_source("cat.jpg", b"local-jpeg");
    let service = env.service(FakeEncoder::new());

    let mut scoped = request("/cat.jpg", "image/webp");
    scoped.origin = Some("http://shop.example.com".to_string());
    let response = service.convert(&scoped).await.unwrap();
    assert_eq!(&response.body[..], b"webptenant-jpeg");
    assert!(env.exhaust("webp/shop.example.com/cat.jpg.webp").is_file());

    let mut other = request("/cat.jpg", "image/webp");
    other.origin = Some("http://other.example.com".to_string());
    let response = service.convert(&other).await.unwrap();
    assert_eq!(&response.body[..], b"webplocal-jpeg");
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
}
