// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Upstream transport.
//
// `HttpSender` is the dependency-injection seam between the proxy and
// the network: handlers and the stream engine only ever see the trait,
// so tests script upstream behavior without sockets. `UpstreamPool`
// rotates outbound calls over the configured base URLs.

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::DEFAULT_UPSTREAM_BASE;

// ---------------------------------------------------------------------------
// Transport types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Request the response body as an incremental stream.
    pub stream: bool,
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>),
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),

    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

impl UpstreamBody {
    /// Read the whole body into memory. Streaming errors surface as
    /// transport errors.
    pub async fn collect(self) -> Result<Bytes, UpstreamError> {
        match self {
            UpstreamBody::Full(bytes) => Ok(bytes),
            UpstreamBody::Stream(mut stream) => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    collected.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(collected))
            }
        }
    }

    /// View the body as a chunk stream regardless of how it arrived.
    pub fn into_stream(self) -> Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>> {
        match self {
            UpstreamBody::Full(bytes) => Box::pin(futures_util::stream::once(async move { Ok(bytes) })),
            UpstreamBody::Stream(stream) => stream,
        }
    }
}

/// Sends HTTP requests to the upstream API.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Reqwest sender
// ---------------------------------------------------------------------------

pub struct ReqwestHttpSender {
    client: reqwest::Client,
}

impl ReqwestHttpSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpSender {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl HttpSender for ReqwestHttpSender {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let mut req = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if !request.body.is_empty() {
            req = req.body(request.body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(e.to_string())
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();

        if request.stream {
            let stream = resp
                .bytes_stream()
                .map_err(|e| UpstreamError::Transport(e.to_string()));
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Stream(Box::pin(stream)),
            })
        } else {
            let body = resp
                .bytes()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Full(body),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Round-robin pool
// ---------------------------------------------------------------------------

/// Immutable ordered list of upstream base URLs plus a monotonic counter.
///
/// Selection happens exactly once per outbound call (including retries),
/// so consecutive attempts may land on different upstreams. K concurrent
/// selections over N bases always cover a contiguous counter range: the
/// fetch-add is the only synchronization needed.
pub struct UpstreamPool {
    bases: Vec<String>,
    counter: AtomicU64,
}

impl UpstreamPool {
    pub fn new(bases: Vec<String>) -> Self {
        let bases = if bases.is_empty() {
            vec![DEFAULT_UPSTREAM_BASE.to_string()]
        } else {
            bases
        };
        Self {
            bases,
            counter: AtomicU64::new(0),
        }
    }

    /// Select the next base URL.
    pub fn select(&self) -> &str {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % self.bases.len();
        &self.bases[index]
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }
}

/// Join a base URL and an inbound path-and-query.
pub fn join_url(base: &str, path_and_query: &str) -> String {
    let base = base.trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{base}{path_and_query}")
    } else {
        format!("{base}/{path_and_query}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool(n: usize) -> UpstreamPool {
        UpstreamPool::new((0..n).map(|i| format!("https://b{i}.example.com")).collect())
    }

    #[test]
    fn empty_list_falls_back_to_default_base() {
        let pool = UpstreamPool::new(Vec::new());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.select(), DEFAULT_UPSTREAM_BASE);
    }

    #[test]
    fn selection_rotates_in_order_and_wraps() {
        let pool = pool(3);
        assert_eq!(pool.select(), "https://b0.example.com");
        assert_eq!(pool.select(), "https://b1.example.com");
        assert_eq!(pool.select(), "https://b2.example.com");
        assert_eq!(pool.select(), "https://b0.example.com");
    }

    #[test]
    fn concurrent_selections_cover_a_contiguous_range() {
        let pool = Arc::new(pool(4));
        let selections = 4;

        let handles: Vec<_> = (0..selections)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.select().to_string())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            seen.insert(handle.join().unwrap());
        }
        // 4 concurrent selections over 4 bases: no duplicates, no skips.
        assert_eq!(seen.len(), selections);
    }

    #[test]
    fn join_url_handles_trailing_slashes() {
        assert_eq!(
            join_url("https://a.example.com/", "/v1beta/models/m:gen?alt=sse"),
            "https://a.example.com/v1beta/models/m:gen?alt=sse"
        );
        assert_eq!(
            join_url("https://a.example.com", "v1/x"),
            "https://a.example.com/v1/x"
        );
    }

    #[tokio::test]
    async fn collect_drains_a_chunked_body() {
        let chunks: Vec<Result<Bytes, UpstreamError>> =
            vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))];
        let body = UpstreamBody::Stream(Box::pin(futures_util::stream::iter(chunks)));
        assert_eq!(body.collect().await.unwrap(), Bytes::from("hello world"));
    }
}
