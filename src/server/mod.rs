// Server module - thin HTTP front-end over ImageService
//
// Routes:
//   GET /healthz  liveness check
//   GET /*        image conversion
// Anything else gets 405.

use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, ACCEPT, ALLOW, CONTENT_TYPE, ETAG, HOST, IF_NONE_MATCH, USER_AGENT,
    VARY,
};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::service::{ConvertRequest, ImageService};

pub const HEALTHZ_PATH: &str = "/healthz";

const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Accept connections until the task is dropped
pub async fn serve(listener: TcpListener, service: ImageService) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "Listening");
    }

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let service = service.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(handle(&service, req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                tracing::debug!(remote = %remote, error = %e, "Connection closed with error");
            }
        });
    }
}

/// Handle one request; the body is never read
pub async fn handle<B>(service: &ImageService, req: Request<B>) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let (parts, _) = req.into_parts();

    let response = route(service, &parts).await;

    tracing::info!(
        method = %parts.method,
        path = %parts.uri.path(),
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

async fn route(service: &ImageService, req: &Parts) -> Response<Full<Bytes>> {
    if req.method != Method::GET {
        let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    if req.uri.path() == HEALTHZ_PATH {
        return text(StatusCode::OK, service.healthz());
    }

    let request = ConvertRequest {
        path: req.uri.path().to_string(),
        query: parse_query(req.uri.query()),
        accept: header_string(req, ACCEPT),
        user_agent: header_string(req, USER_AGENT),
        origin: request_origin(req),
    };
    // JXL selection also looks at the User-Agent
    let vary = if service.options().toggles.jxl {
        "Accept, User-Agent"
    } else {
        "Accept"
    };

    match service.convert(&request).await {
        Ok(converted) => {
            let etag = format!("W/\"{}\"", converted.etag);
            let not_modified = req
                .headers
                .get(IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').any(|tag| tag.trim() == etag))
                .unwrap_or(false);

            let builder = Response::builder()
                .header(VARY, vary)
                .header(ETAG, etag.as_str());
            let built = if not_modified {
                builder
                    .status(StatusCode::NOT_MODIFIED)
                    .body(Full::new(Bytes::new()))
            } else {
                builder
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, converted.content_type.as_str())
                    .body(Full::new(converted.body))
            };
            built.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to build response");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            })
        }
        Err(e) => {
            let status = StatusCode::from_u16(e.to_http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                tracing::error!(path = %request.path, error = %e, "Conversion request failed");
            } else {
                tracing::debug!(path = %request.path, error = %e, "Conversion request rejected");
            }
            text(status, &e.to_string())
        }
    }
}

fn text(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// `scheme://host[:port]` the client addressed, from Host and X-Forwarded-Proto
fn request_origin(req: &Parts) -> Option<String> {
    let host = header_string(req, HOST)
        .or_else(|| req.uri.authority().map(|a| a.to_string()))?;
    let scheme = header_string(req, X_FORWARDED_PROTO)
        .or_else(|| req.uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());
    Some(format!("{}://{}", scheme.trim().to_ascii_lowercase(), host.trim()))
}

fn header_string(req: &Parts, name: HeaderName) -> Option<String> {
    req.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode `a=1&b=2`; later duplicates win
fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key).map(|k| k.into_owned());
        let value = urlencoding::decode(value).map(|v| v.into_owned());
        if let (Ok(key), Ok(value)) = (key, value) {
            params.insert(key, value);
        }
    }
    params
}
