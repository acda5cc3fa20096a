// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Secret scrubbing for payloads that leave the process.
//!
//! Applied to `content` and to every string inside metadata before an
//! `xsend` frame is handed to the relay. Rules run in order; the
//! environment-assignment rule runs first so `KEY=sk-...` collapses to
//! `KEY=[REDACTED]` instead of leaving the value dangling under another
//! rule.

use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";
const REDACTED_PATH: &str = "[REDACTED_PATH]";

/// Recursion cap for the metadata walk. `serde_json::Value` cannot form
/// reference cycles, so depth is the only unbounded dimension.
const MAX_DEPTH: usize = 16;

/// Compile a static rule pattern.
#[allow(clippy::unwrap_used)] // patterns are literals, checked by tests
fn rule(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

static ENV_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)\b([A-Z0-9_]*(?:SECRET|TOKEN|PASSWORD|PASSWD|API_?KEY|PRIVATE_KEY|ACCESS_KEY|CREDENTIALS?)[A-Z0-9_]*)\s*=\s*\S+")
});

static JSON_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    rule(r#"(?i)"([a-z0-9_-]*(?:secret|token|password|passwd|api_?key|private_key|access_key|credentials?)[a-z0-9_-]*)"\s*:\s*"[^"]*""#)
});

static BEARER: LazyLock<Regex> =
    LazyLock::new(|| rule(r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]{8,}"));

static KEY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"\b(?:sk-[A-Za-z0-9_-]{10,}|ghp_[A-Za-z0-9]{16,}|gho_[A-Za-z0-9]{16,}|glpat-[A-Za-z0-9_-]{10,}|xox[baprs]-[A-Za-z0-9-]{10,}|AKIA[0-9A-Z]{16})\b")
});

static SENSITIVE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    rule(r"(?i)(?:[\w.~-]*/)+[\w.~-]*(?:\.env|id_rsa|credentials?|token|secret)[\w.~-]*")
});

/// Scrub one string.
pub fn redact_text(input: &str) -> String {
    let out = ENV_ASSIGNMENT.replace_all(input, format!("${{1}}={REDACTED}"));
    let out = JSON_VALUE.replace_all(&out, format!(r#""${{1}}":"{REDACTED}""#));
    let out = BEARER.replace_all(&out, format!("${{1}} {REDACTED}"));
    let out = KEY_PREFIX.replace_all(&out, REDACTED);
    let out = SENSITIVE_PATH.replace_all(&out, REDACTED_PATH);
    out.into_owned()
}

/// Scrub a metadata tree in place: strings are run through
/// [`redact_text`], and any value under a sensitive key is replaced
/// wholesale.
pub fn redact_value(value: &mut serde_json::Value) {
    redact_value_at(value, MAX_DEPTH);
}

fn redact_value_at(value: &mut serde_json::Value, depth: usize) {
    if depth == 0 {
        return;
    }
    match value {
        serde_json::Value::String(s) => {
            let scrubbed = redact_text(s);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_value_at(item, depth - 1);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *item = serde_json::Value::String(REDACTED.to_owned());
                } else {
                    redact_value_at(item, depth - 1);
                }
            }
        }
        _ => {}
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    [
        "secret",
        "token",
        "password",
        "passwd",
        "api_key",
        "apikey",
        "private_key",
        "access_key",
        "credential",
    ]
    .iter()
    .any(|marker| key.contains(marker))
}

#[cfg(test)]
#[path = "redact_tests.rs"]
mod tests;
