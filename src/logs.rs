// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Observability endpoints consumed by the dashboard:
// - GET /logs/antiblock.json?limit=N  -- stats + recent sessions
// - GET /logs/stream                  -- live start/retry/finish events

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use crate::metrics::Tracker;
use crate::proxy::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct SnapshotParams {
    #[serde(default)]
    limit: usize,
}

/// Snapshot polled by the dashboard.
pub async fn logs_json(
    State(state): State<AppState>,
    Query(params): Query<SnapshotParams>,
) -> Response {
    let snapshot = state.tracker.snapshot(params.limit);
    let mut response = axum::Json(snapshot).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Unsubscribes when the client's event stream is dropped.
struct SubscriptionGuard {
    tracker: Arc<Tracker>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.tracker.unsubscribe(self.id);
    }
}

/// Live lifecycle events over SSE.
///
/// Opens with a `: heartbeat` comment so clients see bytes immediately;
/// idle periods get a `: ping` comment every 30 s.
pub async fn logs_stream(State(state): State<AppState>) -> Response {
    let (id, receiver) = state.tracker.subscribe();
    let guard = SubscriptionGuard {
        tracker: state.tracker.clone(),
        id,
    };

    let events = ReceiverStream::new(receiver).map(move |payload| {
        let _subscribed = &guard;
        Ok::<Event, Infallible>(Event::default().data(payload))
    });
    let stream = futures_util::stream::once(async {
        Ok::<Event, Infallible>(Event::default().comment("heartbeat"))
    })
    .chain(events);

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("ping"),
    );

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
