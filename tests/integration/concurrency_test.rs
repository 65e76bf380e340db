// Concurrent request handling
//
// Simultaneous requests for the same artifact share one conversion, and a
// client going away does not abort it.

use super::test_harness::{request, FakeEncoder, TestEnv};
use std::time::Duration;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_requests_convert_once() {
    let env = TestEnv::new(|_| {});
    env.write_source("big.jpg", b"big-jpeg");
    let encoder = FakeEncoder::slow(Duration::from_millis(200));
    let service = env.service(encoder.clone());

    let mut set = JoinSet::new();
    for _ in 0..12 {
        let service = service.clone();
        set.spawn(async move { service.convert(&request("/big.jpg", "image/webp")).await });
    }

    let mut bodies = Vec::new();
    while let Some(result) = set.join_next().await {
        bodies.push(result.unwrap().unwrap().body);
    }

    assert_eq!(bodies.len(), 12);
    assert!(bodies.iter().all(|b| &b[..] == b"webpbig-jpeg"));
    assert_eq!(encoder.calls(), 1);
    assert!(service.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_convert_independently() {
    let env = TestEnv::new(|_| {});
    for i in 0..5 {
        env.write_source(&format!("img{}.jpg", i), format!("jpeg-{}", i).as_bytes());
    }
    let encoder = FakeEncoder::slow(Duration::from_millis(50));
    let service = env.service(encoder.clone());

    let mut set = JoinSet::new();
    for i in 0..5 {
        let service = service.clone();
        set.spawn(async move {
            service
                .convert(&request(&format!("/img{}.jpg", i), "image/webp"))
                .await
        });
    }
    while let Some(result) = set.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(encoder.calls(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_request_still_populates_cache() {
    let env = TestEnv::new(|_| {});
    env.write_source("big.jpg", b"big-jpeg");
    let encoder = FakeEncoder::slow(Duration::from_millis(300));
    let service = env.service(encoder.clone());

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.convert(&request("/big.jpg", "image/webp")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    pending.abort();

    // Give the detached conversion time to finish
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(env.exhaust("webp/local/big.jpg.webp").is_file());

    let response = service
        .convert(&request("/big.jpg", "image/webp"))
        .await
        .unwrap();
    assert_eq!(&response.body[..], b"webpbig-jpeg");
    assert_eq!(encoder.calls(), 1);
}
