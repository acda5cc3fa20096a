// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trace correlation and ID minting.
//!
//! Every externally observable effect carries a `(traceId, parentEventId,
//! eventId)` tuple. A dispatch inherits the incoming trace, promotes the
//! incoming event to `parentEventId`, and mints a fresh `eventId`.

use serde::{Deserialize, Serialize};

/// Correlation tuple propagated through every externally visible effect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    pub event_id: String,
}

impl TraceContext {
    /// Start a fresh trace (no parent).
    pub fn root() -> Self {
        Self { trace_id: new_trace_id(), parent_event_id: None, event_id: new_event_id() }
    }

    /// Derive the dispatch context from an incoming trace: keep the trace
    /// ID, promote the incoming event to parent, mint a new event.
    pub fn derive(incoming: Option<&TraceContext>) -> Self {
        match incoming {
            Some(t) => Self {
                trace_id: if t.trace_id.trim().is_empty() {
                    new_trace_id()
                } else {
                    t.trace_id.clone()
                },
                parent_event_id: if t.event_id.trim().is_empty() {
                    None
                } else {
                    Some(t.event_id.clone())
                },
                event_id: new_event_id(),
            },
            None => Self::root(),
        }
    }
}

pub fn new_trace_id() -> String {
    format!("tr-{}", uuid::Uuid::new_v4())
}

pub fn new_event_id() -> String {
    format!("ev-{}", uuid::Uuid::new_v4())
}

pub fn new_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

pub fn new_queue_id() -> String {
    format!("oq-{}", uuid::Uuid::new_v4())
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "trace_tests.rs"]
mod tests;
