// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structured-metadata normalization for bridge traffic.
//!
//! Cross-device messages may carry a `structured` object describing what
//! kind of coordination artifact they are. The type vocabulary is closed;
//! anything else is downgraded to an FYI so a peer never has to interpret
//! a type it does not know.

use serde_json::{json, Value};

/// The closed structured-message vocabulary.
pub const KNOWN_TYPES: [&str; 6] =
    ["FYI", "ConflictCheck", "Blocker", "Approval", "ConflictResult", "ApprovalResult"];

/// Maximum detail length when synthesizing a structured entry from
/// message content.
const SYNTHESIZED_DETAIL_MAX: usize = 280;

/// Normalize `metadata.structured` in place. Known types are canonicalized
/// (case-insensitively); unknown types are downgraded to an FYI that
/// preserves the original type for debugging.
pub fn normalize_metadata(metadata: &mut Value) {
    let Some(structured) = metadata.get_mut("structured") else {
        return;
    };
    let Some(obj) = structured.as_object_mut() else {
        // A non-object `structured` field carries no usable shape.
        *structured = synthesize("", None);
        return;
    };

    let raw_type = obj.get("type").and_then(Value::as_str).unwrap_or("").to_owned();
    match canonical_type(&raw_type) {
        Some(canonical) => {
            obj.insert("type".to_owned(), Value::String(canonical.to_owned()));
        }
        None => {
            let detail = obj
                .get("payload")
                .and_then(|p| p.get("detail"))
                .and_then(Value::as_str)
                .unwrap_or(&raw_type)
                .to_owned();
            *structured = json!({
                "type": "FYI",
                "payload": {
                    "category": "status",
                    "detail": detail,
                    "impact": "context-only",
                    "originalType": raw_type,
                },
            });
        }
    }
}

/// Ensure inbound metadata carries a structured entry, synthesizing one
/// from the message content when the sender provided none.
pub fn ensure_structured(metadata: Option<Value>, content: &str) -> Value {
    let mut metadata = match metadata {
        Some(Value::Object(map)) => Value::Object(map),
        _ => json!({}),
    };
    if metadata.get("structured").is_none() {
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("structured".to_owned(), synthesize(content, None));
        }
    }
    normalize_metadata(&mut metadata);
    metadata
}

fn canonical_type(raw: &str) -> Option<&'static str> {
    let raw = raw.trim();
    KNOWN_TYPES.iter().find(|t| t.eq_ignore_ascii_case(raw)).copied()
}

fn synthesize(content: &str, original_type: Option<&str>) -> Value {
    let mut detail: String = content.chars().take(SYNTHESIZED_DETAIL_MAX).collect();
    if detail.is_empty() {
        detail = "(no content)".to_owned();
    }
    let mut payload = json!({
        "category": "status",
        "detail": detail,
        "impact": "context-only",
    });
    if let (Some(obj), Some(raw)) = (payload.as_object_mut(), original_type) {
        obj.insert("originalType".to_owned(), Value::String(raw.to_owned()));
    }
    json!({ "type": "FYI", "payload": payload })
}

#[cfg(test)]
#[path = "structured_tests.rs"]
mod tests;
