// Cache behavior integration tests
//
// Conversions are persisted once and reused until the source checksum changes.

use super::test_harness::{request, FakeEncoder, TestEnv};
use picshift::metadata::ChecksumMode;
use picshift::transcoder::OutputFormat;
use std::fs::File;
use std::time::{Duration, SystemTime};

#[tokio::test]
async fn test_second_request_served_from_cache() {
    let env = TestEnv::new(|_| {});
    env.write_source("photos/cat.jpg", b"original-jpeg");
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    let first = service
        .convert(&request("/photos/cat.jpg", "image/webp,*/*"))
        .await
        .unwrap();
    let second = service
        .convert(&request("/photos/cat.jpg", "image/webp,*/*"))
        .await
        .unwrap();

    assert_eq!(first.served_format, OutputFormat::WebP);
    assert_eq!(first.content_type, "image/webp");
    assert_eq!(&first.body[..], b"webporiginal-jpeg");
    assert_eq!(first.body, second.body);
    assert_eq!(first.etag, second.etag);
    assert_eq!(encoder.calls(), 1);
    assert!(env.exhaust("webp/local/photos/cat.jpg.webp").is_file());
}

#[tokio::test]
async fn test_each_format_cached_separately() {
    let env = TestEnv::new(|_| {});
    env.write_source("dog.png", b"png-bytes");
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    let avif = service
        .convert(&request("/dog.png", "image/avif,image/webp"))
        .await
        .unwrap();
    let webp = service
        .convert(&request("/dog.png", "image/webp"))
        .await
        .unwrap();

    assert_eq!(avif.served_format, OutputFormat::Avif);
    assert_eq!(webp.served_format, OutputFormat::WebP);
    assert_ne!(avif.etag, webp.etag);
    assert_eq!(encoder.calls(), 2);
    assert!(env.exhaust("avif/local/dog.png.avif").is_file());
    assert!(env.exhaust("webp/local/dog.png.webp").is_file());
}

#[tokio::test]
async fn test_content_change_triggers_reconversion() {
    let env = TestEnv::new(|_| {});
    env.write_source("cat.jpg", b"version-one");
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    let before = service
        .convert(&request("/cat.jpg", "image/webp"))
        .await
        .unwrap();
    env.write_source("cat.jpg", b"version-two");
    let after = service
        .convert(&request("/cat.jpg", "image/webp"))
        .await
        .unwrap();

    assert_eq!(encoder.calls(), 2);
    assert_eq!(&after.body[..], b"webpversion-two");
    assert_ne!(before.etag, after.etag);
}

#[tokio::test]
async fn test_size_mtime_mode_notices_touch() {
    let env = TestEnv::new(|c| c.checksum_mode = ChecksumMode::SizeMtime);
    let path = env.write_source("cat.jpg", b"same-bytes");
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    service
        .convert(&request("/cat.jpg", "image/webp"))
        .await
        .unwrap();
    service
        .convert(&request("/cat.jpg", "image/webp"))
        .await
        .unwrap();
    assert_eq!(encoder.calls(), 1);

    // Same content, new modification time
    let file = File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(30))
        .unwrap();
    drop(file);

    service
        .convert(&request("/cat.jpg", "image/webp"))
        .await
        .unwrap();
    assert_eq!(encoder.calls(), 2);
}

#[tokio::test]
async fn test_plain_client_gets_source_untouched() {
    let env = TestEnv::new(|_| {});
    env.write_source("cat.jpg", b"original-jpeg");
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    let response = service
        .convert(&request("/cat.jpg", "image/png,*/*"))
        .await
        .unwrap();

    assert_eq!(response.served_format, OutputFormat::Original);
    assert_eq!(response.content_type, "image/jpeg");
    assert_eq!(&response.body[..], b"original-jpeg");
    assert_eq!(encoder.calls(), 0);
}

#[tokio::test]
async fn test_non_transcodable_source_passes_through() {
    let env = TestEnv::new(|_| {});
    env.write_source("logo.svg", b"<svg/>");
    let encoder = FakeEncoder::new();
    let service = env.service(encoder.clone());

    let response = service
        .convert(&request("/logo.svg", "image/avif,image/webp"))
        .await
        .unwrap();

    assert_eq!(response.served_format, OutputFormat::Original);
    assert_eq!(response.content_type, "image/svg+xml");
    assert_eq!(encoder.calls(), 0);
}

#[tokio::test]
async fn test_missing_source_is_not_found() {
    let env = TestEnv::new(|_| {});
    let service = env.service(FakeEncoder::new());

    let err = service
        .convert(&request("/nope.jpg", "image/webp"))
        .await
        .unwrap_err();

    assert_eq!(err.to_http_status(), 404);
}

#[tokio::test]
async fn test_disallowed_extension_rejected() {
    let env = TestEnv::new(|c| c.allowed_types = vec!["jpg".into()]);
    env.write_source("cat.png", b"png");
    let service = env.service(FakeEncoder::new());

    let err = service
        .convert(&request("/cat.png", "image/webp"))
        .await
        .unwrap_err();

    assert_eq!(err.to_http_status(), 415);
}

#[tokio::test]
async fn test_deleted_source_drops_cached_artifacts() {
    let env = TestEnv::new(|_| {});
    let src = env.write_source("gone/cat.jpg", b"original-jpeg");
    let service = env.service(FakeEncoder::new());

    service
        .convert(&request("/gone/cat.jpg", "image/webp"))
        .await
        .unwrap();
    service
        .convert(&request("/gone/cat.jpg", "image/avif"))
        .await
        .unwrap();
    assert!(env.exhaust("webp/local/gone/cat.jpg.webp").is_file());
    let records = std::fs::read_dir(&env.config.metadata_path).unwrap().count();
    assert_eq!(records, 2);

    std::fs::remove_file(&src).unwrap();
    let err = service
        .convert(&request("/gone/cat.jpg", "image/webp"))
        .await
        .unwrap_err();

    assert_eq!(err.to_http_status(), 404);
    assert!(!env.exhaust("webp/local/gone/cat.jpg.webp").exists());
    assert!(!env.exhaust("avif/local/gone/cat.jpg.avif").exists());
    assert_eq!(
        std::fs::read_dir(&env.config.metadata_path).unwrap().count(),
        0
    );
}
