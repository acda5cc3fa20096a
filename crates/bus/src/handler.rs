// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The external message-handler seam.
//!
//! The dispatcher talks to every non-WebSocket transport (PTY injection,
//! triggers, the bridge policy layer) through a single function-valued
//! interface supplied at start time. The core never knows what is behind
//! it.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::proto::Priority;
use crate::trace::TraceContext;

/// The frame material handed to the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMessage {
    /// `send` or `broadcast`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDelivery {
    pub client_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub message: DeliveryMessage,
    pub trace_context: TraceContext,
}

/// Handler verdict. Absent fields are inferred by the dispatcher; `ok`
/// and `success` are interchangeable spellings from legacy handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerVerdict {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl HandlerVerdict {
    pub fn effective_ok(&self) -> bool {
        self.ok.or(self.success).unwrap_or(false)
    }

    pub fn effective_verified(&self) -> bool {
        self.verified.unwrap_or_else(|| self.effective_ok())
    }

    pub fn effective_accepted(&self) -> bool {
        self.accepted.unwrap_or_else(|| self.effective_verified())
    }

    pub fn effective_queued(&self) -> bool {
        self.queued.unwrap_or(false)
    }
}

/// The single seam between the routing core and the host. Returning
/// `Ok(None)` means the handler declined the frame; an `Err` surfaces as
/// a `handler_error` ACK.
pub type MessageHandler = Arc<
    dyn Fn(HandlerDelivery) -> BoxFuture<'static, anyhow::Result<Option<HandlerVerdict>>>
        + Send
        + Sync,
>;

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
