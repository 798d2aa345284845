// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Google-style JSON error envelopes.
//
// Everything client-visible that is not proxied upstream bytes goes
// through here: synthesized envelopes for local failures, and
// normalization of upstream error bodies (adding the RPC `status`
// string when the upstream omitted it).

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use serde_json::{json, Value};

/// Map an HTTP status code to the Google RPC status string.
pub fn google_status(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        502 => "BAD_GATEWAY",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// Build a Google-style error envelope.
pub fn error_envelope(code: u16, message: &str, details: Option<&str>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
        "status": google_status(code),
    });
    if let Some(details) = details {
        if !details.is_empty() {
            error["details"] = json!([detail_value(details)]);
        }
    }
    json!({ "error": error })
}

/// Normalize an upstream error body.
///
/// If the body parses as JSON carrying an `error` object, the object is
/// forwarded as-is except that a missing `status` is synthesized from
/// the numeric `code`. Anything else is wrapped in a fresh envelope with
/// the raw body as details.
pub fn normalize_upstream_error(status: u16, body: &[u8]) -> Value {
    if let Ok(mut parsed) = serde_json::from_slice::<Value>(body) {
        if let Some(error) = parsed.get_mut("error").and_then(Value::as_object_mut) {
            if !error.contains_key("status") {
                let code = error
                    .get("code")
                    .and_then(Value::as_u64)
                    .map(|c| c as u16)
                    .unwrap_or(status);
                error.insert("status".to_string(), json!(google_status(code)));
            }
            return parsed;
        }
    }

    let message = match status {
        429 => "Resource has been exhausted (e.g. check quota).",
        _ => "Request failed",
    };
    error_envelope(status, message, Some(&String::from_utf8_lossy(body)))
}

/// Build a JSON error response with permissive CORS, the way every
/// non-proxied error leaves this server.
pub fn json_error(status: StatusCode, message: &str, details: &str) -> Response<Body> {
    let envelope = error_envelope(status.as_u16(), message, Some(details));
    json_response(status, &envelope)
}

/// Serialize a JSON value as a response body with CORS headers.
pub fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

/// Detail entries keep structured upstream bodies structured.
fn detail_value(details: &str) -> Value {
    serde_json::from_str(details).unwrap_or_else(|_| Value::String(details.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_matches_rpc_codes() {
        assert_eq!(google_status(400), "INVALID_ARGUMENT");
        assert_eq!(google_status(401), "UNAUTHENTICATED");
        assert_eq!(google_status(403), "PERMISSION_DENIED");
        assert_eq!(google_status(404), "NOT_FOUND");
        assert_eq!(google_status(429), "RESOURCE_EXHAUSTED");
        assert_eq!(google_status(500), "INTERNAL");
        assert_eq!(google_status(502), "BAD_GATEWAY");
        assert_eq!(google_status(503), "UNAVAILABLE");
        assert_eq!(google_status(504), "DEADLINE_EXCEEDED");
        assert_eq!(google_status(418), "UNKNOWN");
    }

    #[test]
    fn envelope_carries_code_message_and_status() {
        let envelope = error_envelope(504, "retry limit exceeded", None);
        assert_eq!(envelope["error"]["code"], 504);
        assert_eq!(envelope["error"]["message"], "retry limit exceeded");
        assert_eq!(envelope["error"]["status"], "DEADLINE_EXCEEDED");
        assert!(envelope["error"].get("details").is_none());
    }

    #[test]
    fn upstream_error_gains_synthesized_status() {
        let body = br#"{"error":{"code":429,"message":"quota"}}"#;
        let normalized = normalize_upstream_error(429, body);
        assert_eq!(normalized["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(normalized["error"]["message"], "quota");
    }

    #[test]
    fn upstream_error_with_status_is_untouched() {
        let body = br#"{"error":{"code":403,"message":"nope","status":"PERMISSION_DENIED","details":[{"reason":"KEY"}]}}"#;
        let normalized = normalize_upstream_error(403, body);
        assert_eq!(
            normalized,
            serde_json::from_slice::<Value>(body).unwrap()
        );
    }

    #[test]
    fn non_json_upstream_body_is_wrapped() {
        let normalized = normalize_upstream_error(502, b"<html>bad gateway</html>");
        assert_eq!(normalized["error"]["code"], 502);
        assert_eq!(normalized["error"]["status"], "BAD_GATEWAY");
        assert_eq!(normalized["error"]["details"][0], "<html>bad gateway</html>");
    }

    #[test]
    fn quota_message_for_429_fallback() {
        let normalized = normalize_upstream_error(429, b"too many requests");
        assert_eq!(
            normalized["error"]["message"],
            "Resource has been exhausted (e.g. check quota)."
        );
    }
}
