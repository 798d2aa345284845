// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Completion heuristics.
//
// Pure classification over parsed event payloads and accumulated text.
// Precedence, applied by the engine after each event: blocked, then
// sentinel completion, then retryable finish reasons; on stream close,
// the optional punctuation heuristic decides between complete and
// truncated.

use serde_json::Value;

use crate::sentinel::SENTINEL_TOKEN;

/// Finish reasons that mean the turn was cut short and should resume.
pub const RETRYABLE_FINISH_REASONS: &[&str] = &["MAX_TOKENS", "SAFETY", "RECITATION", "OTHER"];

/// Characters accepted as a terminal sentence boundary by the
/// punctuation heuristic.
pub const TERMINAL_PUNCTUATION: &[char] =
    &['.', '!', '?', '。', '！', '？', '…', '"', '”', '’', ')'];

// ---------------------------------------------------------------------------
// Payload probes
// ---------------------------------------------------------------------------

/// A non-empty `promptFeedback.blockReason`, or a safety rating with
/// `blocked: true`, makes the turn terminal and non-retryable.
pub fn block_reason(payload: &Value) -> Option<String> {
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(Value::as_str)
    {
        if !reason.is_empty() {
            return Some(reason.to_string());
        }
    }

    let ratings = payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("safetyRatings"))
        .and_then(Value::as_array)?;
    for rating in ratings {
        if rating.get("blocked").and_then(Value::as_bool) == Some(true) {
            let category = rating
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or("SAFETY");
            return Some(category.to_string());
        }
    }
    None
}

/// `candidates[0].finishReason`, if present and non-empty.
pub fn finish_reason(payload: &Value) -> Option<String> {
    payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .map(String::from)
}

pub fn is_retryable_finish(reason: &str) -> bool {
    RETRYABLE_FINISH_REASONS.contains(&reason)
}

// ---------------------------------------------------------------------------
// Sentinel detection
// ---------------------------------------------------------------------------

/// Whether the text ends with the sentinel token, ignoring trailing
/// whitespace.
pub fn ends_with_sentinel(text: &str) -> bool {
    text.trim_end().ends_with(SENTINEL_TOKEN)
}

/// Remove the trailing sentinel token plus the whitespace around it.
pub fn strip_sentinel(text: &str) -> String {
    let trimmed = text.trim_end();
    match trimmed.strip_suffix(SENTINEL_TOKEN) {
        Some(rest) => rest.trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Split text about to be forwarded into `(emit, hold)`.
///
/// `hold` is the maximal trailing run of whitespace optionally followed
/// by a proper prefix of the sentinel token: text that must not be sent
/// yet because the sentinel could still materialize from it. Everything
/// before it is safe to emit.
pub fn split_holdback(text: &str) -> (&str, &str) {
    let mut boundary = text.len();

    if let Some(bracket) = text.rfind('[') {
        if SENTINEL_TOKEN.starts_with(&text[bracket..]) {
            boundary = bracket;
        }
    }
    // Whitespace adjacent to a potential sentinel (or trailing) is held
    // too, so a stripped completion leaves no dangling separator.
    boundary = text[..boundary].trim_end().len();

    text.split_at(boundary)
}

// ---------------------------------------------------------------------------
// Punctuation heuristic
// ---------------------------------------------------------------------------

/// Whether the accumulated text ends, after trimming whitespace, with
/// an accepted terminal punctuation character.
pub fn ends_with_terminal_punctuation(text: &str) -> bool {
    text.trim_end()
        .chars()
        .next_back()
        .is_some_and(|c| TERMINAL_PUNCTUATION.contains(&c))
}
