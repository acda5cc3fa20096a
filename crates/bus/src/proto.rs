// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire frame definitions for the local bus protocol.
//!
//! Frames are internally-tagged JSON enums (`{"type": "send", ...}`) with
//! kebab-case tags and camelCase fields. One WebSocket text message carries
//! exactly one frame. Decoding is tolerant: non-JSON input degrades to a
//! bare text frame instead of tearing down the connection.

use serde::{Deserialize, Serialize};

use crate::trace::TraceContext;

/// Hard cap on a single frame (and on `send` content).
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Message priority carried on `send` frames and delivered messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Frames accepted from connected agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Register {
        role: Option<String>,
        pane_id: Option<String>,
    },
    Send {
        target: String,
        content: String,
        #[serde(default)]
        priority: Priority,
        message_id: Option<String>,
        #[serde(default)]
        ack_required: bool,
        metadata: Option<serde_json::Value>,
        trace_context: Option<TraceContext>,
    },
    Broadcast {
        content: String,
        message_id: Option<String>,
        #[serde(default)]
        ack_required: bool,
        metadata: Option<serde_json::Value>,
        trace_context: Option<TraceContext>,
    },
    HealthCheck {
        target: String,
        stale_after_ms: Option<u64>,
        request_id: Option<String>,
    },
    DeliveryCheck {
        message_id: String,
        request_id: Option<String>,
    },
    Heartbeat {},
}

/// Frames emitted to connected agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        client_id: u64,
    },
    Registered {
        role: Option<String>,
        pane_id: Option<String>,
    },
    Message {
        from: String,
        priority: Priority,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_event_id: Option<String>,
        event_id: String,
        timestamp: u64,
    },
    Broadcast {
        from: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_event_id: Option<String>,
        event_id: String,
        timestamp: u64,
    },
    SendAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(flatten)]
        ack: AckRecord,
        trace_id: String,
        timestamp: u64,
    },
    HealthCheckResult {
        target: String,
        healthy: bool,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        age_ms: Option<u64>,
        stale_threshold_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pane_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    DeliveryCheckResult {
        known: bool,
        message_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ack: Option<AckRecord>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pane_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

/// Aggregated delivery outcome for one dispatched frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRecord {
    pub ok: bool,
    pub accepted: bool,
    pub queued: bool,
    pub verified: bool,
    pub status: String,
    pub ws_delivery_count: u32,
    pub ack_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe: Option<DedupeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_result: Option<serde_json::Value>,
}

/// How a replayed ACK was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeMode {
    Cache,
    SignatureCache,
    SignaturePending,
}

impl DedupeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::SignatureCache => "signature_cache",
            Self::SignaturePending => "signature_pending",
        }
    }
}

/// Dedup provenance attached to replayed ACKs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupeInfo {
    pub mode: DedupeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
}

/// Result of tolerant frame decoding.
#[derive(Debug, Clone)]
pub enum Decoded {
    Frame(ClientFrame),
    /// Input that is not JSON at all. Routed as an unaddressed text frame
    /// and rejected with an `error` reply.
    Text { content: String },
    /// JSON without a recognizable `type` (missing or unknown).
    Invalid { request_id: Option<String> },
}

/// Decode one inbound WebSocket text message.
pub fn decode(text: &str) -> Decoded {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => Decoded::Frame(frame),
        Err(_) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => Decoded::Invalid {
                request_id: value
                    .get("requestId")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned),
            },
            Err(_) => Decoded::Text { content: text.to_owned() },
        },
    }
}

/// Trim a wire identifier, mapping blank to `None`.
pub fn clean_ident(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
}

#[cfg(test)]
#[path = "proto_tests.rs"]
mod tests;
