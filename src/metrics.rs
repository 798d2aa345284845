// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Request lifecycle tracking.
//
// One `SessionEntry` per inbound request: created at entry, mutated
// while active, moved into a bounded ring when finalized. Aggregate
// counters are plain atomics; live subscribers get best-effort JSON
// notifications (slow subscribers lose events, never block producers).
//
// The tracker is a value behind `Arc`, not a global, so tests can spin
// up isolated instances.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Completed sessions retained for the dashboard.
pub const RING_CAPACITY: usize = 200;

/// Per-subscriber channel depth before events are dropped.
const SUBSCRIBER_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One proxied request, as displayed by the dashboard.
///
/// Field names match the wire format of the log endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    #[serde(rename = "upstreamUrl", skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub model: String,
    pub streaming: bool,
    #[serde(rename = "antiblockEnabled")]
    pub antiblock: bool,
    #[serde(rename = "handlingMode")]
    pub mode: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,
    pub status: u16,
    pub retries: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "clientIp", skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

/// Aggregated counters for display.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    #[serde(rename = "totalRequests")]
    pub total_requests: u64,
    #[serde(rename = "retryCount")]
    pub retry_count: u64,
    #[serde(rename = "errorCount")]
    pub error_count: u64,
    #[serde(rename = "successCount")]
    pub success_count: u64,
    #[serde(rename = "lastActivity", skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Top-level snapshot returned to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub stats: Stats,
    pub logs: Vec<SessionEntry>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct Tracker {
    total: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
    successes: AtomicU64,
    last_activity: RwLock<Option<DateTime<Utc>>>,
    active: Mutex<HashMap<String, SessionEntry>>,
    ring: Mutex<VecDeque<SessionEntry>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<String>,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            last_activity: RwLock::new(None),
            active: Mutex::new(HashMap::new()),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Record a new session and broadcast its start event.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        request_id: &str,
        method: &str,
        path: &str,
        model: &str,
        streaming: bool,
        antiblock: bool,
        mode: &str,
        client_ip: Option<String>,
    ) {
        let model = if model.is_empty() {
            model_from_path(path).unwrap_or_default()
        } else {
            model.to_string()
        };
        let entry = SessionEntry {
            id: request_id.to_string(),
            timestamp: Utc::now(),
            method: method.to_string(),
            path: path.to_string(),
            upstream: None,
            model,
            streaming,
            antiblock,
            mode: mode.to_string(),
            duration_ms: 0,
            status: 0,
            retries: 0,
            success: false,
            error: None,
            client_ip,
        };

        self.total.fetch_add(1, Ordering::Relaxed);
        self.touch();

        self.active
            .lock()
            .unwrap()
            .insert(request_id.to_string(), entry.clone());

        self.broadcast(json!({ "type": "start", "entry": entry }));
    }

    /// Count a retry against the session and the global counter.
    pub fn inc_retry(&self, request_id: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.active.lock().unwrap();
            if let Some(entry) = active.get_mut(request_id) {
                entry.retries += 1;
            }
        }
        self.broadcast(json!({ "type": "retry", "requestId": request_id }));
    }

    /// Record the upstream a session is talking to, normalized to
    /// scheme+host (paths and query strings stay private).
    pub fn set_upstream(&self, request_id: &str, upstream: &str) {
        let normalized = normalize_upstream_display(upstream);
        let mut active = self.active.lock().unwrap();
        if let Some(entry) = active.get_mut(request_id) {
            entry.upstream = Some(normalized);
        }
    }

    /// Finalize a session: move it to the ring, bump outcome counters,
    /// broadcast the finish event. Unknown ids are ignored, so double
    /// finalization is harmless.
    pub fn finish(&self, request_id: &str, status: u16, success: bool, error: &str) {
        let now = Utc::now();
        self.touch();

        let entry = {
            let mut active = self.active.lock().unwrap();
            active.remove(request_id)
        };
        let Some(mut entry) = entry else {
            return;
        };

        entry.status = status;
        entry.success = success;
        entry.error = (!error.is_empty()).then(|| error.to_string());
        entry.duration_ms = (now - entry.timestamp).num_milliseconds();

        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }

        self.broadcast(json!({ "type": "finish", "entry": entry }));
    }

    /// Deep-copied stats plus the most recent `limit` completed sessions
    /// (all of them when `limit` is zero).
    pub fn snapshot(&self, limit: usize) -> Snapshot {
        let stats = Stats {
            total_requests: self.total.load(Ordering::Relaxed),
            retry_count: self.retries.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            success_count: self.successes.load(Ordering::Relaxed),
            last_activity: *self.last_activity.read().unwrap(),
        };

        let ring = self.ring.lock().unwrap();
        let skip = if limit > 0 && ring.len() > limit {
            ring.len() - limit
        } else {
            0
        };
        let logs = ring.iter().skip(skip).cloned().collect();

        Snapshot { stats, logs }
    }

    /// Number of in-flight sessions.
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Register a live subscriber. Returns its id and the event channel;
    /// each event is one serialized JSON object.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap()
            .push(Subscriber { id, sender });
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap()
            .retain(|subscriber| subscriber.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    fn touch(&self) {
        *self.last_activity.write().unwrap() = Some(Utc::now());
    }

    /// Best-effort fan-out: full channels drop the event for that
    /// subscriber only; closed channels are pruned afterwards.
    fn broadcast(&self, event: Value) {
        let payload = event.to_string();
        let mut dead: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read().unwrap();
            for subscriber in subscribers.iter() {
                match subscriber.sender.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(subscriber.id),
                }
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .write()
                .unwrap()
                .retain(|subscriber| !dead.contains(&subscriber.id));
        }
    }
}

// ---------------------------------------------------------------------------
// Session guard
// ---------------------------------------------------------------------------

/// Finalizes a session exactly once.
///
/// Handlers finish explicitly on every terminal path; if the handler
/// future is dropped instead (client disconnect), the `Drop` impl
/// finalizes with the 499-equivalent outcome so no session leaks.
pub struct SessionGuard {
    tracker: Arc<Tracker>,
    id: String,
    finished: AtomicBool,
}

impl SessionGuard {
    pub fn new(tracker: Arc<Tracker>, id: String) -> Self {
        Self {
            tracker,
            id,
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn finish(&self, status: u16, success: bool, error: &str) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.tracker.finish(&self.id, status, success, error);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.tracker.finish(&self.id, 499, false, "client cancelled");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keep scheme and host, discard path and query.
fn normalize_upstream_display(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("https", raw),
    };
    let host = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or(rest);
    if host.is_empty() {
        return raw.to_string();
    }
    format!("{scheme}://{host}")
}

/// Fallback model extraction for sessions started without one.
fn model_from_path(path: &str) -> Option<String> {
    let rest = path.split("/models/").nth(1)?;
    let model: String = rest
        .chars()
        .take_while(|&c| c != ':' && c != '/')
        .collect();
    (!model.is_empty()).then_some(model)
}

/// Client IP for display: first `X-Forwarded-For` element, else the
/// socket address.
pub fn client_ip(headers: &axum::http::HeaderMap, peer: Option<std::net::SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
}
