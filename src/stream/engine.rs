// Stream reassembly and retry engine.
//
// Orchestrates one or more upstream calls so the client observes a
// single uninterrupted SSE stream. Reads events from the current
// upstream, rewrites/forwards them downstream, and on truncation
// splices a continuation request using the text already delivered.
//
// The engine runs in a spawned task and talks to the response body
// through a bounded mpsc channel; a failed send (or `Sender::closed`)
// means the client went away, which cancels upstream reads, the retry
// delay, and any further upstream calls.

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::continuation;
use super::detector;
use super::parser::SseParser;
use super::types::{Accumulator, SseEvent, StreamError};
use crate::config::Config;
use crate::error;
use crate::metrics::{SessionGuard, Tracker};
use crate::upstream::{join_url, HttpSender, UpstreamBody, UpstreamError, UpstreamPool, UpstreamRequest};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything the engine needs about one client request.
pub struct StreamContext {
    pub request_id: String,
    /// Inbound path plus query, appended to each selected base URL.
    pub path_and_query: String,
    /// Already-filtered headers to forward upstream.
    pub headers: HeaderMap,
    /// The inbound JSON body with the sentinel directive injected.
    pub request_body: Value,
}

/// Result of the initial upstream call.
pub enum StartOutcome {
    /// Upstream accepted; stream processing may begin.
    Opened {
        body: UpstreamBody,
        retries_used: u32,
    },
    /// Upstream rejected the request before any bytes were forwarded.
    UpstreamError { status: StatusCode, body: Bytes },
    /// The upstream could not be reached at all.
    Transport(UpstreamError),
}

enum PumpOutcome {
    Complete,
    Blocked(String),
    Truncated(String),
    ClientGone,
}

enum EventAction {
    Continue,
    Stop(PumpOutcome),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct StreamEngine {
    config: Arc<Config>,
    http: Arc<dyn HttpSender>,
    pool: Arc<UpstreamPool>,
    tracker: Arc<Tracker>,
}

impl StreamEngine {
    pub fn new(
        config: Arc<Config>,
        http: Arc<dyn HttpSender>,
        pool: Arc<UpstreamPool>,
        tracker: Arc<Tracker>,
    ) -> Self {
        Self {
            config,
            http,
            pool,
            tracker,
        }
    }

    /// Issue the initial upstream call.
    ///
    /// Transient rejections (5xx or 429) are retried with the fixed
    /// delay while no bytes have been forwarded, consuming the shared
    /// retry budget. Any other rejection surfaces to the caller with
    /// the upstream's status so it can be returned as the response.
    pub async fn start(&self, ctx: &StreamContext) -> StartOutcome {
        let body_bytes = Bytes::from(ctx.request_body.to_string());
        let mut retries_used: u32 = 0;

        loop {
            let url = join_url(self.pool.select(), &ctx.path_and_query);
            self.tracker.set_upstream(&ctx.request_id, &url);

            let request = UpstreamRequest {
                method: Method::POST,
                url: url.clone(),
                headers: ctx.headers.clone(),
                body: body_bytes.clone(),
                stream: true,
            };

            match self.http.send(request).await {
                Ok(resp) if resp.status == StatusCode::OK => {
                    return StartOutcome::Opened {
                        body: resp.body,
                        retries_used,
                    };
                }
                Ok(resp)
                    if is_transient(resp.status)
                        && retries_used < self.config.max_consecutive_retries =>
                {
                    retries_used += 1;
                    self.tracker.inc_retry(&ctx.request_id);
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        status = %resp.status,
                        retry = retries_used,
                        "transient initial failure; retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Ok(resp) => {
                    let status = resp.status;
                    let body = resp.body.collect().await.unwrap_or_default();
                    return StartOutcome::UpstreamError { status, body };
                }
                Err(err) if retries_used < self.config.max_consecutive_retries => {
                    retries_used += 1;
                    self.tracker.inc_retry(&ctx.request_id);
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        error = %err,
                        retry = retries_used,
                        "initial upstream call failed; retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => return StartOutcome::Transport(err),
            }
        }
    }

    /// Drive the stream to a terminal outcome, finalizing the session.
    pub async fn run(
        &self,
        ctx: StreamContext,
        first_body: UpstreamBody,
        retries_used: u32,
        tx: mpsc::Sender<Bytes>,
        session: SessionGuard,
    ) {
        let mut acc = Accumulator::new(retries_used);
        let mut body = first_body;

        let outcome = loop {
            acc.begin_attempt();
            match self.pump(&mut acc, body, &tx).await {
                PumpOutcome::Complete => break Ok(()),
                PumpOutcome::Blocked(reason) => break Err(StreamError::Blocked(reason)),
                PumpOutcome::ClientGone => break Err(StreamError::ClientCancelled),
                PumpOutcome::Truncated(reason) => {
                    tracing::info!(
                        request_id = %ctx.request_id,
                        reason = %reason,
                        retries = acc.retries_used,
                        forwarded_chars = acc.text_so_far.len(),
                        "stream truncated; attempting continuation"
                    );
                    match self.next_upstream(&ctx, &mut acc, &tx).await {
                        Ok(next) => body = next,
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    retries = acc.retries_used,
                    forwarded_chars = acc.text_so_far.len(),
                    "stream completed"
                );
                session.finish(200, true, "");
            }
            Err(err @ StreamError::RetryLimitExceeded(_)) => {
                let message = err.to_string();
                tracing::error!(request_id = %ctx.request_id, "{message}");
                let envelope = error::error_envelope(504, &message, None);
                let _ = tx.send(encode_sse(&None, &envelope.to_string())).await;
                session.finish(504, false, &message);
            }
            Err(err @ StreamError::Blocked(_)) => {
                let message = err.to_string();
                tracing::warn!(request_id = %ctx.request_id, "{message}");
                session.finish(200, false, &message);
            }
            Err(StreamError::ClientCancelled) => {
                tracing::debug!(request_id = %ctx.request_id, "client cancelled");
                session.finish(499, false, "client cancelled");
            }
        }
    }

    /// Read one upstream stream until it ends or classification stops it.
    async fn pump(
        &self,
        acc: &mut Accumulator,
        body: UpstreamBody,
        tx: &mpsc::Sender<Bytes>,
    ) -> PumpOutcome {
        let mut parser = SseParser::new();
        let mut stream = body.into_stream();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = tx.closed() => return PumpOutcome::ClientGone,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for event in parser.push(&bytes) {
                        match self.handle_event(acc, event, tx).await {
                            EventAction::Continue => {}
                            EventAction::Stop(outcome) => return outcome,
                        }
                    }
                }
                Some(Err(err)) => {
                    if !self.flush_holdback(acc, tx).await {
                        return PumpOutcome::ClientGone;
                    }
                    return PumpOutcome::Truncated(format!("upstream read error: {err}"));
                }
                None => {
                    if !self.flush_holdback(acc, tx).await {
                        return PumpOutcome::ClientGone;
                    }
                    return self.classify_close(acc);
                }
            }
        }
    }

    /// Process one parsed event: classify, rewrite, forward.
    async fn handle_event(
        &self,
        acc: &mut Accumulator,
        event: SseEvent,
        tx: &mpsc::Sender<Bytes>,
    ) -> EventAction {
        let Ok(mut payload) = serde_json::from_str::<Value>(&event.data) else {
            // Non-JSON payload: forward untouched.
            if !send(tx, encode_sse(&event.event, &event.data)).await {
                return EventAction::Stop(PumpOutcome::ClientGone);
            }
            return EventAction::Continue;
        };

        // Blocked content is terminal and not retryable. Held text is
        // released first, then the upstream payload is forwarded as the
        // stream's final event.
        if let Some(reason) = detector::block_reason(&payload) {
            acc.blocked = true;
            if !self.flush_holdback(acc, tx).await {
                return EventAction::Stop(PumpOutcome::ClientGone);
            }
            if !send(tx, encode_sse(&event.event, &event.data)).await {
                return EventAction::Stop(PumpOutcome::ClientGone);
            }
            return EventAction::Stop(PumpOutcome::Blocked(reason));
        }

        let finish = detector::finish_reason(&payload);
        if let Some(reason) = &finish {
            acc.last_finish_reason = Some(reason.clone());
        }
        let finish_retryable = finish.as_deref().is_some_and(detector::is_retryable_finish);

        let mut rewritten = false;

        if self.config.swallow_thoughts_after_retry && acc.retries_used > 0 {
            let swallowed = strip_thought_parts(&mut payload);
            if !swallowed.is_empty() {
                acc.thought_so_far.push_str(&swallowed);
                rewritten = true;
            }
        }

        // A premature terminal marker would end the client's read loop
        // and make the splice visible; the retry loop replaces it.
        if finish_retryable {
            remove_finish_reason(&mut payload);
            rewritten = true;
        }

        let text = extract_text(&payload);
        let mut completed = false;

        if !text.is_empty() {
            acc.saw_any_text = true;
            let combined = format!("{}{}", acc.held, text);
            acc.held.clear();

            if detector::ends_with_sentinel(&combined) {
                let emit = detector::strip_sentinel(&combined);
                rewrite_text_parts(&mut payload, &emit);
                rewritten = true;
                acc.text_so_far.push_str(&emit);
                completed = true;
            } else {
                let (emit, hold) = detector::split_holdback(&combined);
                let emit = emit.to_string();
                acc.held = hold.to_string();
                if emit != text {
                    rewrite_text_parts(&mut payload, &emit);
                    rewritten = true;
                }
                acc.text_so_far.push_str(&emit);
            }
        }

        let frame = if rewritten {
            payload_has_substance(&payload)
                .then(|| encode_sse(&event.event, &payload.to_string()))
        } else {
            Some(encode_sse(&event.event, &event.data))
        };
        if let Some(frame) = frame {
            if !send(tx, frame).await {
                return EventAction::Stop(PumpOutcome::ClientGone);
            }
        }

        if completed {
            return EventAction::Stop(PumpOutcome::Complete);
        }
        if finish_retryable {
            // This attempt is over; the sentinel can no longer arrive
            // on it, so any held text is real output.
            if !self.flush_holdback(acc, tx).await {
                return EventAction::Stop(PumpOutcome::ClientGone);
            }
            let reason = finish.unwrap_or_default();
            return EventAction::Stop(PumpOutcome::Truncated(format!(
                "retryable finish reason: {reason}"
            )));
        }
        EventAction::Continue
    }

    /// Forward any text still held back as a sentinel candidate.
    ///
    /// Once the stream ends the sentinel can no longer materialize, so
    /// the held fragment is real model output: it must reach the client
    /// and `text_so_far` before classification, or the splice would
    /// silently lose it. Returns false if the client is gone.
    async fn flush_holdback(&self, acc: &mut Accumulator, tx: &mpsc::Sender<Bytes>) -> bool {
        if acc.held.is_empty() {
            return true;
        }
        let held = std::mem::take(&mut acc.held);
        tracing::debug!(held = %held, "flushing unresolved sentinel fragment at stream end");
        acc.text_so_far.push_str(&held);
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": held }], "role": "model" },
                "index": 0
            }]
        });
        send(tx, encode_sse(&None, &payload.to_string())).await
    }

    /// Classify a cleanly closed upstream stream.
    fn classify_close(&self, acc: &Accumulator) -> PumpOutcome {
        if self.config.enable_punctuation_heuristic
            && acc.saw_any_text
            && detector::ends_with_terminal_punctuation(&acc.text_so_far)
        {
            return PumpOutcome::Complete;
        }
        let reason = match &acc.last_finish_reason {
            Some(reason) => format!("stream closed after finishReason {reason} without sentinel"),
            None => "stream closed without completion signal".to_string(),
        };
        PumpOutcome::Truncated(reason)
    }

    /// Open the next continuation stream, consuming the retry budget.
    async fn next_upstream(
        &self,
        ctx: &StreamContext,
        acc: &mut Accumulator,
        tx: &mpsc::Sender<Bytes>,
    ) -> Result<UpstreamBody, StreamError> {
        loop {
            if acc.retries_used >= self.config.max_consecutive_retries {
                return Err(StreamError::RetryLimitExceeded(acc.retries_used));
            }
            acc.retries_used += 1;
            self.tracker.inc_retry(&ctx.request_id);

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_delay) => {}
                _ = tx.closed() => return Err(StreamError::ClientCancelled),
            }

            let body = continuation::build_continuation_body(&ctx.request_body, &acc.text_so_far);
            let url = join_url(self.pool.select(), &ctx.path_and_query);
            self.tracker.set_upstream(&ctx.request_id, &url);

            let request = UpstreamRequest {
                method: Method::POST,
                url: url.clone(),
                headers: ctx.headers.clone(),
                body: Bytes::from(body.to_string()),
                stream: true,
            };

            let attempt = tokio::select! {
                attempt = self.http.send(request) => attempt,
                _ = tx.closed() => return Err(StreamError::ClientCancelled),
            };

            match attempt {
                Ok(resp) if resp.status == StatusCode::OK => {
                    tracing::info!(
                        request_id = %ctx.request_id,
                        retry = acc.retries_used,
                        url = %url,
                        "continuation stream opened"
                    );
                    return Ok(resp.body);
                }
                Ok(resp) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        status = %resp.status,
                        retry = acc.retries_used,
                        "continuation attempt rejected"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        error = %err,
                        retry = acc.retries_used,
                        "continuation attempt failed"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn send(tx: &mpsc::Sender<Bytes>, frame: Bytes) -> bool {
    tx.send(frame).await.is_ok()
}

/// Encode one SSE frame; payload newlines become multiple `data:` lines.
fn encode_sse(event: &Option<String>, data: &str) -> Bytes {
    let mut out = String::with_capacity(data.len() + 16);
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

fn candidate_parts_mut(payload: &mut Value) -> Option<&mut Vec<Value>> {
    payload
        .get_mut("candidates")?
        .get_mut(0)?
        .get_mut("content")?
        .get_mut("parts")?
        .as_array_mut()
}

fn is_thought_part(part: &Value) -> bool {
    part.get("thought").and_then(Value::as_bool) == Some(true)
}

fn part_text(part: &Value) -> Option<&str> {
    part.get("text").and_then(Value::as_str)
}

/// Concatenated text of all non-thought parts.
fn extract_text(payload: &Value) -> String {
    let mut text = String::new();
    if let Some(parts) = payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if is_thought_part(part) {
                continue;
            }
            if let Some(t) = part_text(part) {
                text.push_str(t);
            }
        }
    }
    text
}

/// Remove `thought: true` parts, returning their concatenated text.
fn strip_thought_parts(payload: &mut Value) -> String {
    let mut swallowed = String::new();
    if let Some(parts) = candidate_parts_mut(payload) {
        parts.retain(|part| {
            if is_thought_part(part) {
                if let Some(t) = part_text(part) {
                    swallowed.push_str(t);
                }
                false
            } else {
                true
            }
        });
    }
    swallowed
}

fn remove_finish_reason(payload: &mut Value) {
    if let Some(candidate) = payload
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(Value::as_object_mut)
    {
        candidate.remove("finishReason");
    }
}

/// Replace the event's non-thought text with `new_text`: the first text
/// part carries it, any further text parts are dropped. Empty text
/// removes them all.
fn rewrite_text_parts(payload: &mut Value, new_text: &str) {
    let Some(parts) = candidate_parts_mut(payload) else {
        return;
    };
    let mut replaced = false;
    parts.retain_mut(|part| {
        if is_thought_part(part) || part_text(part).is_none() {
            return true;
        }
        if replaced || new_text.is_empty() {
            return false;
        }
        replaced = true;
        if let Some(obj) = part.as_object_mut() {
            obj.insert("text".to_string(), Value::String(new_text.to_string()));
        }
        true
    });
}

/// Whether a rewritten payload still carries anything worth forwarding.
fn payload_has_substance(payload: &Value) -> bool {
    if payload.get("usageMetadata").is_some() || payload.get("promptFeedback").is_some() {
        return true;
    }
    let Some(candidate) = payload.get("candidates").and_then(|c| c.get(0)) else {
        return false;
    };
    if candidate.get("finishReason").is_some() {
        return true;
    }
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .is_some_and(|parts| !parts.is_empty())
}
