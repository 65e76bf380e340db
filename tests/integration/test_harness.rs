// Test utilities: temp-dir configured services, fake encoders, a local origin
// server and a running front-end.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use picshift::config::Config;
use picshift::locks::SystemClock;
use picshift::service::{ConvertRequest, ImageService};
use picshift::transcoder::{TranscodeError, TranscodeJob, Transform};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;

/// Prefixes the source with the target format name and counts invocations.
/// An optional delay stands in for a slow encoder.
pub struct FakeEncoder {
    calls: AtomicUsize,
    delay: Duration,
}

impl FakeEncoder {
    pub fn new() -> Arc<Self> {
        Self::slow(Duration::ZERO)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transform for FakeEncoder {
    fn transform(&self, source: &[u8], job: &TranscodeJob) -> Result<Vec<u8>, TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut out = job.format.as_str().as_bytes().to_vec();
        out.extend_from_slice(source);
        Ok(out)
    }
}

/// Directory layout of one test instance
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = Config {
            image_path: dir.path().join("pics"),
            exhaust_path: dir.path().join("exhaust"),
            metadata_path: dir.path().join("metadata"),
            remote_raw_path: dir.path().join("remote-raw"),
            convert_types: vec!["webp".into(), "avif".into()],
            ..Default::default()
        };
        configure(&mut config);
        std::fs::create_dir_all(&config.image_path).expect("image root");
        Self { dir, config }
    }

    pub fn source(&self, rel: &str) -> PathBuf {
        self.config.image_path.join(rel)
    }

    pub fn write_source(&self, rel: &str, data: &[u8]) -> PathBuf {
        let path = self.source(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("source dir");
        std::fs::write(&path, data).expect("write source");
        path
    }

    pub fn exhaust(&self, rel: &str) -> PathBuf {
        self.config.exhaust_path.join(rel)
    }

    pub fn service(&self, transform: Arc<dyn Transform>) -> ImageService {
        ImageService::with_parts(&self.config, transform, Arc::new(SystemClock))
            .expect("service")
    }
}

pub fn request(path: &str, accept: &str) -> ConvertRequest {
    ConvertRequest {
        path: path.to_string(),
        query: HashMap::new(),
        accept: Some(accept.to_string()),
        ..Default::default()
    }
}

/// Total bytes of regular files under `root`
pub fn tree_size(root: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += tree_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

/// A local origin serving fixed bodies with ETags
pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Origin {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Serve `files` (path → body); the ETag is derived from the body length.
/// Unknown paths get 404.
pub async fn spawn_origin(files: HashMap<String, Vec<u8>>) -> Origin {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let files = Arc::new(files);

    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let files = files.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let response = match files.get(req.uri().path()) {
                        Some(body) => {
                            let etag = format!("\"len-{}\"", body.len());
                            let fresh = req
                                .headers()
                                .get("if-none-match")
                                .map(|v| v.as_bytes() == etag.as_bytes())
                                .unwrap_or(false);
                            if fresh {
                                Response::builder()
                                    .status(304)
                                    .body(Full::new(Bytes::new()))
                                    .unwrap()
                            } else {
                                Response::builder()
                                    .header("etag", etag)
                                    .body(Full::new(Bytes::from(body.clone())))
                                    .unwrap()
                            }
                        }
                        None => Response::builder()
                            .status(404)
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    };
                    async move { Ok::<_, Infallible>(response) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Origin { addr, hits }
}

/// Run the front-end on an ephemeral port
pub async fn spawn_server(service: ImageService) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    tokio::spawn(picshift::server::serve(listener, service));
    addr
}

/// Send a request with the path exactly as given, no client-side normalization
pub async fn raw_http_request(
    addr: SocketAddr,
    path: &str,
) -> Result<(u16, String), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(addr).await?;
    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            eprintln!("Connection failed: {:?}", err);
        }
    });

    let req = hyper::Request::builder()
        .method("GET")
        .uri(path)
        .header("Host", addr.to_string())
        .body(Full::new(Bytes::new()))?;

    let res = sender.send_request(req).await?;
    let status = res.status().as_u16();
    let body_bytes = res.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body_bytes).to_string()))
}
