// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Continuation request builder.
//
// When a stream is truncated, the next upstream call replays the
// original request with the partial assistant response spliced in as a
// model turn, followed by a user directive to resume. Everything else
// in the body (generationConfig, tools, safety settings, the injected
// system instruction) is preserved untouched.

use serde_json::{json, Value};

/// Directive asking the model to resume exactly where it stopped.
pub const CONTINUATION_DIRECTIVE: &str = "Continue your response exactly where it left off. \
     Do not repeat anything you have already written and do not add any preamble or \
     commentary. Remember: at the very end of your entire response, you must still write \
     the token [done] to signal completion.";

/// Build the upstream body for a continuation attempt.
pub fn build_continuation_body(original: &Value, text_so_far: &str) -> Value {
    let mut body = original.clone();
    if let Some(obj) = body.as_object_mut() {
        let contents = obj
            .entry("contents")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(turns) = contents {
            turns.push(json!({
                "role": "model",
                "parts": [{ "text": text_so_far }]
            }));
            turns.push(json!({
                "role": "user",
                "parts": [{ "text": CONTINUATION_DIRECTIVE }]
            }));
        }
    }
    body
}
