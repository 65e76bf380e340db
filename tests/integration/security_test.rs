// Path validation over a running server
//
// Raw requests bypass client-side normalization so traversal attempts reach
// the resolver as sent.

use super::test_harness::{raw_http_request, spawn_server, FakeEncoder, TestEnv};

async fn server_with_secret() -> (TestEnv, std::net::SocketAddr) {
    let env = TestEnv::new(|_| {});
    env.write_source("ok.jpg", b"jpeg");
    std::fs::write(env.dir.path().join("secret.jpg"), b"do not serve").unwrap();
    let addr = spawn_server(env.service(FakeEncoder::new())).await;
    (env, addr)
}

#[tokio::test]
async fn test_path_traversal_blocked() {
    let (_env, addr) = server_with_secret().await;

    for path in ["/../secret.jpg", "/a/../../secret.jpg", "/%2e%2e/secret.jpg"] {
        let (status, body) = raw_http_request(addr, path).await.unwrap();
        assert_eq!(status, 400, "path {} should be rejected", path);
        assert!(!body.contains("do not serve"));
    }
}

#[tokio::test]
async fn test_encoded_separator_and_nul_blocked() {
    let (_env, addr) = server_with_secret().await;

    for path in ["/..%2fsecret.jpg", "/ok%00.jpg", "/..%5csecret.jpg"] {
        let (status, _) = raw_http_request(addr, path).await.unwrap();
        assert_eq!(status, 400, "path {} should be rejected", path);
    }
}

#[tokio::test]
async fn test_inner_dot_segments_allowed() {
    let (_env, addr) = server_with_secret().await;

    let (status, body) = raw_http_request(addr, "/a/../ok.jpg").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "jpeg");
}

#[tokio::test]
async fn test_healthz() {
    let (_env, addr) = server_with_secret().await;

    let (status, body) = raw_http_request(addr, "/healthz").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "OK");
}
