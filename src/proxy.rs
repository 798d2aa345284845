// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// HTTP proxy front.
//
// Responsibilities:
// - Router construction and shared state
// - CORS preflight handling
// - Streaming detection and handling-mode dispatch
// - Rate-limit gate before any upstream work
// - Passthrough streaming and non-streaming forwarding
// - Upstream header filtering (only four headers are forwarded)

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::io::Read as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{json_error, json_response, normalize_upstream_error};
use crate::logs;
use crate::metrics::{client_ip, SessionGuard, Tracker};
use crate::ratelimit::{api_key_from_headers, RateLimiter};
use crate::sentinel::{extract_model_identifier, inject_system_prompt, is_antiblock_target};
use crate::stream::{StartOutcome, StreamContext, StreamEngine};
use crate::upstream::{join_url, HttpSender, UpstreamPool, UpstreamRequest};

/// Largest accepted inbound body (inline media can be large).
const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Channel depth between a streaming task and the response body.
const STREAM_CHANNEL_DEPTH: usize = 64;

// Handling modes recorded per session.
const MODE_ANTIBLOCK_STREAM: &str = "antiblock-stream";
const MODE_PASSTHROUGH_STREAM: &str = "passthrough-stream";
const MODE_STREAM_OTHER: &str = "stream";
const MODE_NON_STREAM: &str = "non-stream";

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: Arc<dyn HttpSender>,
    pub pool: Arc<UpstreamPool>,
    pub limiter: Arc<RateLimiter>,
    pub tracker: Arc<Tracker>,
    pub engine: Arc<StreamEngine>,
}

/// Wire up shared state around an injected HTTP sender.
pub fn build_state(config: Arc<Config>, http: Arc<dyn HttpSender>) -> AppState {
    let pool = Arc::new(UpstreamPool::new(config.upstream_bases.clone()));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_count,
        config.rate_limit_window,
    ));
    let tracker = Arc::new(Tracker::new());
    let engine = Arc::new(StreamEngine::new(
        config.clone(),
        http.clone(),
        pool.clone(),
        tracker.clone(),
    ));
    AppState {
        config,
        http,
        pool,
        limiter,
        tracker,
        engine,
    }
}

/// Build the router: log endpoints plus a catch-all proxy handler.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/logs/antiblock.json", get(logs::logs_json))
        .route("/logs/stream", get(logs::logs_stream))
        .fallback(proxy_handler)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn proxy_handler(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Response<Body> {
    if request.method() == Method::OPTIONS {
        return cors_preflight();
    }

    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    // Rate-limit gate. Dropping this future (client disconnect) is the
    // cancellation path; no session exists yet at this point.
    if state.config.enable_rate_limit {
        if let Some(key) = api_key_from_headers(&headers) {
            tracing::debug!(key_suffix = %key_suffix(&key), "enforcing rate limit");
            state.limiter.wait(&key).await;
        }
    }

    let path = uri.path().to_string();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let is_stream = is_streaming_request(&uri);
    let model = extract_model_identifier(&path).unwrap_or_default();
    let antiblock = is_stream
        && method == Method::POST
        && is_antiblock_target(&model, &state.config.antiblock_model_prefixes);
    let mode = handling_mode(is_stream, &method, antiblock);

    let request_id = Uuid::new_v4().to_string();
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        model = %model,
        streaming = is_stream,
        antiblock = antiblock,
        mode = mode,
        "proxying request"
    );

    state.tracker.start(
        &request_id,
        method.as_str(),
        &path,
        &model,
        is_stream,
        antiblock,
        mode,
        client_ip(&headers, peer),
    );
    let guard = SessionGuard::new(state.tracker.clone(), request_id);

    let body_bytes = match axum::body::to_bytes(request.into_body(), BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            guard.finish(400, false, "failed to read request body");
            return json_error(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
                &err.to_string(),
            );
        }
    };

    if antiblock {
        handle_antiblock_stream(state, path_and_query, headers, body_bytes, guard).await
    } else if is_stream {
        handle_passthrough_stream(state, method, path_and_query, headers, body_bytes, guard).await
    } else {
        handle_non_streaming(state, method, path_and_query, headers, body_bytes, guard).await
    }
}

// ---------------------------------------------------------------------------
// Antiblock streaming
// ---------------------------------------------------------------------------

async fn handle_antiblock_stream(
    state: AppState,
    path_and_query: String,
    headers: HeaderMap,
    body_bytes: Bytes,
    guard: SessionGuard,
) -> Response<Body> {
    let mut request_body: Value = match serde_json::from_slice(&body_bytes) {
        Ok(value) => value,
        Err(err) => {
            guard.finish(400, false, "invalid JSON in request body");
            return json_error(
                StatusCode::BAD_REQUEST,
                "Invalid JSON in request body",
                &err.to_string(),
            );
        }
    };

    inject_system_prompt(&mut request_body);

    let ctx = StreamContext {
        request_id: guard.id().to_string(),
        path_and_query,
        headers: upstream_headers(&headers),
        request_body,
    };

    match state.engine.start(&ctx).await {
        StartOutcome::Opened { body, retries_used } => {
            let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_DEPTH);
            let engine = state.engine.clone();
            tokio::spawn(async move {
                engine.run(ctx, body, retries_used, tx, guard).await;
            });

            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Response::builder()
                .status(StatusCode::OK)
                .header(
                    header::CONTENT_TYPE,
                    "text/event-stream; charset=utf-8",
                )
                .header(
                    header::CACHE_CONTROL,
                    "no-cache, no-store, must-revalidate",
                )
                .header(header::PRAGMA, "no-cache")
                .header(header::EXPIRES, "0")
                .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
                .header("x-accel-buffering", "no")
                .body(Body::from_stream(stream))
                .unwrap_or_default()
        }
        StartOutcome::UpstreamError { status, body } => {
            let normalized = normalize_upstream_error(status.as_u16(), &body);
            guard.finish(
                status.as_u16(),
                false,
                &String::from_utf8_lossy(&body),
            );
            json_response(status, &normalized)
        }
        StartOutcome::Transport(err) => {
            guard.finish(502, false, &err.to_string());
            json_error(
                StatusCode::BAD_GATEWAY,
                "Bad Gateway",
                "Failed to connect to upstream server",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Passthrough streaming
// ---------------------------------------------------------------------------

async fn handle_passthrough_stream(
    state: AppState,
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body_bytes: Bytes,
    guard: SessionGuard,
) -> Response<Body> {
    let url = join_url(state.pool.select(), &path_and_query);
    state.tracker.set_upstream(guard.id(), &url);

    let request = UpstreamRequest {
        method,
        url,
        headers: upstream_headers(&headers),
        body: body_bytes,
        stream: true,
    };

    let response = match state.http.send(request).await {
        Ok(response) => response,
        Err(err) => {
            guard.finish(502, false, &err.to_string());
            return json_error(
                StatusCode::BAD_GATEWAY,
                "Bad Gateway",
                "Failed to connect to upstream server",
            );
        }
    };

    let status = response.status;
    if status != StatusCode::OK {
        let raw = response.body.collect().await.unwrap_or_default();
        let normalized = normalize_upstream_error(status.as_u16(), &raw);
        guard.finish(status.as_u16(), false, &String::from_utf8_lossy(&raw));
        return json_response(status, &normalized);
    }

    let mut headers_out = response.headers.clone();
    headers_out.remove(header::CONTENT_LENGTH);
    headers_out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );

    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_DEPTH);
    let mut upstream = response.body.into_stream();
    tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                chunk = upstream.next() => chunk,
                // Client gone: the guard's drop finalizes the session.
                _ = tx.closed() => return,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if tx.send(bytes).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    guard.finish(502, false, &err.to_string());
                    return;
                }
                None => {
                    guard.finish(status.as_u16(), true, "");
                    return;
                }
            }
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = headers_out;
    }
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Non-streaming
// ---------------------------------------------------------------------------

async fn handle_non_streaming(
    state: AppState,
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body_bytes: Bytes,
    guard: SessionGuard,
) -> Response<Body> {
    let url = join_url(state.pool.select(), &path_and_query);
    state.tracker.set_upstream(guard.id(), &url);

    let body = if method == Method::GET || method == Method::HEAD {
        Bytes::new()
    } else {
        body_bytes
    };

    let request = UpstreamRequest {
        method,
        url,
        headers: upstream_headers(&headers),
        body,
        stream: false,
    };

    let response = match state.http.send(request).await {
        Ok(response) => response,
        Err(err) => {
            guard.finish(502, false, &err.to_string());
            return json_error(
                StatusCode::BAD_GATEWAY,
                "Bad Gateway",
                "Failed to connect to upstream server",
            );
        }
    };

    let status = response.status;
    let upstream_headers_in = response.headers;
    let raw = response.body.collect().await.unwrap_or_default();

    if status != StatusCode::OK {
        tracing::debug!(
            status = %status,
            preview = %String::from_utf8_lossy(&raw[..raw.len().min(800)]),
            "upstream rejected non-streaming request"
        );
        let normalized = normalize_upstream_error(status.as_u16(), &raw);
        guard.finish(status.as_u16(), false, &String::from_utf8_lossy(&raw));
        return json_response(status, &normalized);
    }

    // Decompress so downstream clients always get plain JSON, and drop
    // the headers made stale by it.
    let raw = maybe_gunzip(&upstream_headers_in, raw);

    let mut headers_out = HeaderMap::new();
    for (name, value) in upstream_headers_in.iter() {
        if name == header::CONTENT_ENCODING || name == header::CONTENT_LENGTH {
            continue;
        }
        headers_out.append(name, value.clone());
    }
    headers_out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );

    guard.finish(status.as_u16(), true, "");

    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = headers_out;
    }
    builder.body(Body::from(raw)).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Streaming is detected heuristically: `stream` or `sse` in the path
/// (case-insensitive), or the `alt=sse` query parameter.
pub fn is_streaming_request(uri: &Uri) -> bool {
    let path = uri.path().to_ascii_lowercase();
    if path.contains("stream") || path.contains("sse") {
        return true;
    }
    uri.query()
        .map(|query| query.split('&').any(|pair| pair == "alt=sse"))
        .unwrap_or(false)
}

fn handling_mode(is_stream: bool, method: &Method, antiblock: bool) -> &'static str {
    if !is_stream {
        return MODE_NON_STREAM;
    }
    if method != Method::POST {
        return MODE_STREAM_OTHER;
    }
    if antiblock {
        MODE_ANTIBLOCK_STREAM
    } else {
        MODE_PASSTHROUGH_STREAM
    }
}

/// Only these four inbound headers are forwarded upstream.
pub fn upstream_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [
        header::AUTHORIZATION,
        header::HeaderName::from_static("x-goog-api-key"),
        header::CONTENT_TYPE,
        header::ACCEPT,
    ] {
        if let Some(value) = inbound.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

fn cors_preflight() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "GET, POST, PUT, DELETE, OPTIONS",
        )
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Authorization, X-Goog-Api-Key, X-Requested-With",
        )
        .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
        .body(Body::empty())
        .unwrap_or_default()
}

/// Decompress a gzip body, detected by magic bytes or Content-Encoding.
/// Undecodable bodies pass through unchanged.
fn maybe_gunzip(headers: &HeaderMap, raw: Bytes) -> Bytes {
    let sniffed = raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b;
    let declared = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);
    if !sniffed && !declared {
        return raw;
    }

    let mut decoder = GzDecoder::new(&raw[..]);
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => Bytes::from(decompressed),
        Err(_) => raw,
    }
}

fn key_suffix(key: &str) -> &str {
    let mut boundary = key.len().saturating_sub(4);
    while !key.is_char_boundary(boundary) {
        boundary += 1;
    }
    &key[boundary..]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{UpstreamBody, UpstreamError, UpstreamResponse};
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;
    use tower::ServiceExt; // for oneshot

    /// Mock upstream returning a fixed response.
    struct MockSender {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    }

    impl MockSender {
        fn ok_json(body: &str) -> Self {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Self {
                status: StatusCode::OK,
                headers,
                body: Bytes::copy_from_slice(body.as_bytes()),
            }
        }
    }

    #[async_trait]
    impl HttpSender for MockSender {
        async fn send(
            &self,
            _request: UpstreamRequest,
        ) -> Result<UpstreamResponse, UpstreamError> {
            Ok(UpstreamResponse {
                status: self.status,
                headers: self.headers.clone(),
                body: UpstreamBody::Full(self.body.clone()),
            })
        }
    }

    fn test_app(sender: MockSender) -> (Router, AppState) {
        let config = Arc::new(Config::default());
        let state = build_state(config, Arc::new(sender));
        (build_router(state.clone()), state)
    }

    #[test]
    fn streaming_detection() {
        let stream_path: Uri = "/v1beta/models/m:streamGenerateContent".parse().unwrap();
        let sse_query: Uri = "/v1beta/models/m:generateContent?alt=sse".parse().unwrap();
        let plain: Uri = "/v1beta/models/m:generateContent".parse().unwrap();
        assert!(is_streaming_request(&stream_path));
        assert!(is_streaming_request(&sse_query));
        assert!(!is_streaming_request(&plain));
    }

    #[test]
    fn handling_modes() {
        assert_eq!(handling_mode(false, &Method::POST, false), "non-stream");
        assert_eq!(handling_mode(true, &Method::GET, false), "stream");
        assert_eq!(
            handling_mode(true, &Method::POST, false),
            "passthrough-stream"
        );
        assert_eq!(handling_mode(true, &Method::POST, true), "antiblock-stream");
    }

    #[test]
    fn upstream_headers_filters_to_allowlist() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        inbound.insert("x-goog-api-key", HeaderValue::from_static("key"));
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        inbound.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        inbound.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let filtered = upstream_headers(&inbound);
        assert_eq!(filtered.len(), 4);
        assert!(filtered.get(header::COOKIE).is_none());
        assert!(filtered.get("x-forwarded-for").is_none());
    }

    #[tokio::test]
    async fn options_preflight_gets_cors_response() {
        let (app, _state) = test_app(MockSender::ok_json("{}"));
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/v1beta/models/m:generateContent")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn malformed_json_on_antiblock_path_is_rejected() {
        let (app, state) = test_app(MockSender::ok_json("{}"));
        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("not json {{{"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["status"], "INVALID_ARGUMENT");

        let entry = state.tracker.snapshot(0).logs[0].clone();
        assert!(!entry.success);
        assert_eq!(entry.status, 400);
        assert_eq!(entry.mode, "antiblock-stream");
    }

    #[tokio::test]
    async fn non_streaming_upstream_error_is_normalized() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let sender = MockSender {
            status: StatusCode::NOT_FOUND,
            headers,
            body: Bytes::from_static(br#"{"error":{"code":404,"message":"model not found"}}"#),
        };
        let (app, state) = test_app(sender);

        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/unknown:generateContent")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["status"], "NOT_FOUND");
        assert_eq!(value["error"]["message"], "model not found");

        let entry = state.tracker.snapshot(0).logs[0].clone();
        assert!(!entry.success);
        assert_eq!(entry.status, 404);
    }

    #[tokio::test]
    async fn non_streaming_gzip_body_is_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"candidates":[]}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static("gzip"),
        );
        let sender = MockSender {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(compressed),
        };
        let (app, _state) = test_app(sender);

        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-2.5-flash:generateContent")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"candidates":[]}"#);
    }

    #[tokio::test]
    async fn sessions_record_handling_mode_and_model() {
        let (app, state) = test_app(MockSender::ok_json("{}"));
        let request = Request::builder()
            .method("POST")
            .uri("/v1beta/models/gemini-2.5-flash:generateContent")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let _response = app.oneshot(request).await.unwrap();
        let entry = state.tracker.snapshot(0).logs[0].clone();
        assert_eq!(entry.model, "gemini-2.5-flash");
        assert_eq!(entry.mode, "non-stream");
        assert!(entry.success);
    }
}
