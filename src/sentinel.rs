// Copyright 2026 The Restitch Project
// SPDX-License-Identifier: Apache-2.0

// Sentinel-token prompt injection.
//
// Before the initial upstream call for an antiblock-enabled model, the
// request body is mutated so the system instruction ends with a
// directive telling the model to emit `[done]` when its response is
// truly finished. The stream engine uses that token to distinguish a
// legitimate completion from a silent cut-off.

use serde_json::{json, Map, Value};

/// The literal token the model is instructed to emit at the very end of
/// its full response.
pub const SENTINEL_TOKEN: &str = "[done]";

/// The directive appended to the system instruction.
pub const SENTINEL_DIRECTIVE: &str = "IMPORTANT: At the very end of your entire response, \
     you must write the token [done] to signal completion. This is a mandatory technical \
     requirement.";

/// Ensure the body's `systemInstruction` ends with the sentinel directive.
///
/// Handles both `system_instruction` (snake) and `systemInstruction`
/// (camel): when the snake form is present its parts are merged in front
/// of the camel parts and the snake key is removed, standardizing on the
/// officially recommended camel form before the directive is appended.
pub fn inject_system_prompt(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    let sentinel_part = json!({ "text": SENTINEL_DIRECTIVE });

    // Standardize: merge system_instruction into systemInstruction.
    if let Some(snake) = obj.remove("system_instruction") {
        let mut camel = match obj.remove("systemInstruction") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let mut merged: Vec<Value> = snake
            .get("parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(camel_parts) = camel.get("parts").and_then(Value::as_array) {
            merged.extend(camel_parts.iter().cloned());
        }
        camel.insert("parts".to_string(), Value::Array(merged));
        obj.insert("systemInstruction".to_string(), Value::Object(camel));
    }

    // Missing, null, or not an object: replace the whole field.
    if !obj
        .get("systemInstruction")
        .map(Value::is_object)
        .unwrap_or(false)
    {
        obj.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [sentinel_part] }),
        );
        return;
    }

    let Some(instruction) = obj
        .get_mut("systemInstruction")
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    if instruction.get("parts").map(Value::is_array).unwrap_or(false) {
        // Parts array exists: append the directive.
        if let Some(Value::Array(parts)) = instruction.get_mut("parts") {
            parts.push(sentinel_part);
        }
    } else {
        // Parts missing or of the wrong type: replace it.
        instruction.insert("parts".to_string(), json!([sentinel_part]));
    }
}

/// Extract the model identifier from a request path.
///
/// The identifier is the segment following `models` or `tunedModels`
/// (case-insensitive), truncated at any `:action` suffix.
pub fn extract_model_identifier(path: &str) -> Option<String> {
    let mut segments = path.trim_start_matches('/').split('/');
    while let Some(segment) = segments.next() {
        if segment.eq_ignore_ascii_case("models") || segment.eq_ignore_ascii_case("tunedmodels") {
            let candidate = segments.next()?;
            let model = candidate.split(':').next().unwrap_or(candidate);
            if model.is_empty() {
                return None;
            }
            return Some(model.to_string());
        }
    }
    None
}

/// A model is antiblock-enabled iff its identifier starts with any
/// configured prefix.
pub fn is_antiblock_target(model: &str, prefixes: &[String]) -> bool {
    if model.is_empty() {
        return false;
    }
    prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && model.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive_part() -> Value {
        json!({ "text": SENTINEL_DIRECTIVE })
    }

    #[test]
    fn missing_system_instruction_is_created() {
        let mut body = json!({ "contents": [] });
        inject_system_prompt(&mut body);
        assert_eq!(
            body["systemInstruction"],
            json!({ "parts": [directive_part()] })
        );
    }

    #[test]
    fn null_system_instruction_is_replaced() {
        let mut body = json!({ "systemInstruction": null });
        inject_system_prompt(&mut body);
        assert_eq!(
            body["systemInstruction"],
            json!({ "parts": [directive_part()] })
        );
    }

    #[test]
    fn wrong_typed_system_instruction_is_replaced() {
        let mut body = json!({ "systemInstruction": "be terse" });
        inject_system_prompt(&mut body);
        assert_eq!(
            body["systemInstruction"],
            json!({ "parts": [directive_part()] })
        );
    }

    #[test]
    fn wrong_typed_parts_is_replaced() {
        let mut body = json!({ "systemInstruction": { "parts": "be terse" } });
        inject_system_prompt(&mut body);
        assert_eq!(
            body["systemInstruction"]["parts"],
            json!([directive_part()])
        );
    }

    #[test]
    fn directive_is_appended_to_existing_parts() {
        let mut body = json!({
            "systemInstruction": { "parts": [{ "text": "be terse" }] }
        });
        inject_system_prompt(&mut body);
        assert_eq!(
            body["systemInstruction"]["parts"],
            json!([{ "text": "be terse" }, directive_part()])
        );
    }

    #[test]
    fn snake_parts_are_merged_before_camel_parts() {
        let mut body = json!({
            "system_instruction": { "parts": [{ "text": "snake" }] },
            "systemInstruction": { "parts": [{ "text": "camel" }] }
        });
        inject_system_prompt(&mut body);
        assert!(body.get("system_instruction").is_none());
        assert_eq!(
            body["systemInstruction"]["parts"],
            json!([{ "text": "snake" }, { "text": "camel" }, directive_part()])
        );
    }

    #[test]
    fn snake_only_body_is_standardized() {
        let mut body = json!({
            "system_instruction": { "parts": [{ "text": "snake" }] }
        });
        inject_system_prompt(&mut body);
        assert!(body.get("system_instruction").is_none());
        assert_eq!(
            body["systemInstruction"]["parts"],
            json!([{ "text": "snake" }, directive_part()])
        );
    }

    #[test]
    fn unrelated_fields_are_preserved() {
        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
            "generationConfig": { "temperature": 0.7 },
            "safetySettings": [{ "category": "X", "threshold": "BLOCK_NONE" }]
        });
        let before = body.clone();
        inject_system_prompt(&mut body);
        assert_eq!(body["contents"], before["contents"]);
        assert_eq!(body["generationConfig"], before["generationConfig"]);
        assert_eq!(body["safetySettings"], before["safetySettings"]);
    }

    #[test]
    fn double_injection_adds_exactly_one_more_trailing_part() {
        let mut once = json!({ "contents": [] });
        inject_system_prompt(&mut once);
        let mut twice = once.clone();
        inject_system_prompt(&mut twice);

        let once_parts = once["systemInstruction"]["parts"].as_array().unwrap();
        let twice_parts = twice["systemInstruction"]["parts"].as_array().unwrap();
        assert_eq!(twice_parts.len(), once_parts.len() + 1);
        assert_eq!(twice_parts[..once_parts.len()], once_parts[..]);
        assert_eq!(twice_parts.last(), Some(&directive_part()));
    }

    #[test]
    fn model_identifier_from_generate_path() {
        assert_eq!(
            extract_model_identifier("/v1beta/models/gemini-2.5-pro:streamGenerateContent"),
            Some("gemini-2.5-pro".to_string())
        );
        assert_eq!(
            extract_model_identifier("/v1beta/models/gemini-2.5-flash"),
            Some("gemini-2.5-flash".to_string())
        );
        assert_eq!(
            extract_model_identifier("/v1/tunedModels/my-tuned:generateContent"),
            Some("my-tuned".to_string())
        );
    }

    #[test]
    fn model_identifier_absent_paths() {
        assert_eq!(extract_model_identifier("/v1beta/models"), None);
        assert_eq!(extract_model_identifier("/healthz"), None);
        assert_eq!(extract_model_identifier("/"), None);
    }

    #[test]
    fn antiblock_target_matches_prefixes() {
        let prefixes = vec!["gemini-2.5-pro".to_string(), "gemini-exp".to_string()];
        assert!(is_antiblock_target("gemini-2.5-pro", &prefixes));
        assert!(is_antiblock_target("gemini-2.5-pro-preview", &prefixes));
        assert!(is_antiblock_target("gemini-exp-1206", &prefixes));
        assert!(!is_antiblock_target("gemini-2.5-flash", &prefixes));
        assert!(!is_antiblock_target("", &prefixes));
    }
}
