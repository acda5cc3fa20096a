// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The dispatcher: resolves targets, fans out to live WebSocket clients,
//! invokes the external handler for everything else, and aggregates the
//! result into one `send-ack`.
//!
//! The dispatcher is the only writer of the dedup caches and the only
//! component that parks messages in the outbound queue.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::dedup::{content_signature, AckCache, Decision};
use crate::error::AckStatus;
use crate::handler::{DeliveryMessage, HandlerDelivery, HandlerVerdict, MessageHandler};
use crate::proto::{AckRecord, Priority, ServerFrame};
use crate::queue::{EntryMeta, OutboundQueue};
use crate::registry::{ClientEntry, Registry};
use crate::trace::{now_ms, TraceContext};

/// What kind of fan-out a submission asks for.
#[derive(Debug, Clone)]
pub enum SubmissionKind {
    Send { target: String },
    Broadcast,
}

impl SubmissionKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Broadcast => "broadcast",
        }
    }
}

/// A validated `send` or `broadcast` from a connected client.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: SubmissionKind,
    pub content: String,
    pub priority: Priority,
    pub message_id: Option<String>,
    pub ack_required: bool,
    pub metadata: Option<serde_json::Value>,
    pub trace_context: Option<TraceContext>,
    pub received_at: Instant,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    cache: Arc<AckCache>,
    queue: Arc<OutboundQueue>,
    handler: Option<MessageHandler>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<AckCache>,
        queue: Arc<OutboundQueue>,
        handler: Option<MessageHandler>,
    ) -> Self {
        Self { registry, cache, queue, handler }
    }

    pub fn cache(&self) -> &Arc<AckCache> {
        &self.cache
    }

    /// Route one submission and produce the `send-ack` for the
    /// originator. Retries that hit the dedup caches never re-dispatch.
    pub async fn submit(&self, conn_id: u64, submission: Submission) -> ServerFrame {
        let sender = self.registry.get(conn_id).await;
        let trace = TraceContext::derive(submission.trace_context.as_ref());

        let message_id = submission
            .message_id
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_owned);

        let eligible = submission.ack_required && message_id.is_some();
        if !eligible {
            let record = self.dispatch(conn_id, sender.as_ref(), &submission, &trace).await.0;
            return ack_frame(message_id, record, &trace);
        }

        // Eligible: consult both dedup tiers before any dispatch.
        let sender_role = sender.as_ref().and_then(|c| c.role).map(|r| r.as_str().to_owned());
        let sender_pane = sender.as_ref().and_then(|c| c.pane_id.clone());
        let target = match &submission.kind {
            SubmissionKind::Send { target } => target.clone(),
            SubmissionKind::Broadcast => "*".to_owned(),
        };
        let signature = content_signature(
            submission.kind.as_str(),
            sender_role.as_deref(),
            sender_pane.as_deref(),
            &target,
            submission.priority.as_str(),
            &submission.content,
        );
        let mid = message_id.clone().unwrap_or_default();

        match self.cache.begin(&mid, &signature).await {
            Decision::Replay(record) => {
                debug!(message_id = %mid, mode = ?record.dedupe.as_ref().map(|d| d.mode), "duplicate suppressed");
                ack_frame(message_id, record, &trace)
            }
            Decision::Fresh(guard) => {
                let (record, cacheable) =
                    self.dispatch(conn_id, sender.as_ref(), &submission, &trace).await;
                guard.resolve(&record, cacheable);
                ack_frame(message_id, record, &trace)
            }
        }
    }

    /// The actual fan-out. Returns the ack record and whether it may be
    /// cached (handler errors are observable but retryable).
    async fn dispatch(
        &self,
        conn_id: u64,
        sender: Option<&ClientEntry>,
        submission: &Submission,
        trace: &TraceContext,
    ) -> (AckRecord, bool) {
        let started = submission.received_at;

        let targets = match &submission.kind {
            SubmissionKind::Send { target } => {
                if target.trim().is_empty() {
                    return (finish(invalid_target_ack(), started), true);
                }
                self.registry.lookup(target).await
            }
            SubmissionKind::Broadcast => self.registry.all_except(conn_id).await,
        };

        let from = sender
            .and_then(|c| c.role.map(|r| r.as_str().to_owned()).or_else(|| c.pane_id.clone()))
            .unwrap_or_else(|| "unknown".to_owned());
        let outbound = outbound_frame(&submission.kind, &from, submission, trace);

        let mut ws_delivery_count = 0u32;
        for client in &targets {
            if client.tx.send(outbound.clone()).is_ok() {
                ws_delivery_count += 1;
            }
        }
        debug!(
            kind = submission.kind.as_str(),
            targets = targets.len(),
            delivered = ws_delivery_count,
            trace_id = %trace.trace_id,
            "fan-out complete"
        );

        // The handler is the bridge to non-WS transports; invoking it
        // after a successful WS delivery would double-deliver.
        let mut handler_error: Option<String> = None;
        let mut verdict: Option<HandlerVerdict> = None;
        if ws_delivery_count == 0 {
            if let Some(ref handler) = self.handler {
                let delivery = HandlerDelivery {
                    client_id: conn_id,
                    pane_id: sender.and_then(|c| c.pane_id.clone()),
                    role: sender.and_then(|c| c.role).map(|r| r.as_str().to_owned()),
                    message: DeliveryMessage {
                        kind: submission.kind.as_str().to_owned(),
                        target: match &submission.kind {
                            SubmissionKind::Send { target } => Some(target.clone()),
                            SubmissionKind::Broadcast => None,
                        },
                        content: submission.content.clone(),
                        priority: submission.priority,
                        message_id: submission.message_id.clone(),
                        metadata: submission.metadata.clone(),
                    },
                    trace_context: trace.clone(),
                };
                match handler(delivery).await {
                    Ok(v) => verdict = v,
                    Err(e) => {
                        warn!(err = %e, trace_id = %trace.trace_id, "message handler failed");
                        handler_error = Some(e.to_string());
                    }
                }
            }
        }

        if let Some(error) = handler_error {
            let mut record = AckRecord {
                ok: false,
                accepted: false,
                queued: false,
                verified: false,
                status: AckStatus::HandlerError.as_str().to_owned(),
                ws_delivery_count,
                ack_latency_ms: 0,
                error: Some(error),
                dedupe: None,
                handler_result: None,
            };
            record = finish(record, started);
            return (record, false);
        }

        let handler_verified = verdict.as_ref().is_some_and(HandlerVerdict::effective_verified);
        let handler_accepted = verdict.as_ref().is_some_and(HandlerVerdict::effective_accepted);
        let handler_queued = verdict.as_ref().is_some_and(HandlerVerdict::effective_queued);

        let verified = ws_delivery_count > 0 || handler_verified;
        let mut accepted = verified || handler_accepted;
        let mut queued = verified || handler_queued;
        let mut status = verdict
            .as_ref()
            .and_then(|v| v.status.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                if ws_delivery_count > 0 {
                    AckStatus::DeliveredWebsocket.as_str().to_owned()
                } else if verified {
                    AckStatus::DeliveredVerified.as_str().to_owned()
                } else if accepted {
                    AckStatus::AcceptedUnverified.as_str().to_owned()
                } else {
                    AckStatus::Unrouted.as_str().to_owned()
                }
            });

        // No live target and the handler refused: park the message for
        // the next matching registration. Broadcasts are never queued.
        if let SubmissionKind::Send { target } = &submission.kind {
            if targets.is_empty() && !accepted {
                let meta = EntryMeta {
                    priority: submission.priority,
                    sender_role: sender
                        .and_then(|c| c.role)
                        .map(|r| r.as_str().to_owned()),
                    trace_context: Some(trace.clone()),
                    metadata: submission.metadata.clone(),
                };
                let id = self.queue.enqueue(target, &submission.content, meta, "dispatcher");
                debug!(queue_id = %id, target = %target, "no route, message parked");
                accepted = true;
                queued = true;
                status = AckStatus::AcceptedUnverified.as_str().to_owned();
            }
        }

        let record = AckRecord {
            ok: verified,
            accepted,
            queued,
            verified,
            status,
            ws_delivery_count,
            ack_latency_ms: 0,
            error: None,
            dedupe: None,
            handler_result: verdict
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
        };
        (finish(record, started), true)
    }
}

fn outbound_frame(
    kind: &SubmissionKind,
    from: &str,
    submission: &Submission,
    trace: &TraceContext,
) -> ServerFrame {
    match kind {
        SubmissionKind::Send { .. } => ServerFrame::Message {
            from: from.to_owned(),
            priority: submission.priority,
            content: submission.content.clone(),
            metadata: submission.metadata.clone(),
            trace_id: trace.trace_id.clone(),
            parent_event_id: trace.parent_event_id.clone(),
            event_id: trace.event_id.clone(),
            timestamp: now_ms(),
        },
        SubmissionKind::Broadcast => ServerFrame::Broadcast {
            from: from.to_owned(),
            content: submission.content.clone(),
            metadata: submission.metadata.clone(),
            trace_id: trace.trace_id.clone(),
            parent_event_id: trace.parent_event_id.clone(),
            event_id: trace.event_id.clone(),
            timestamp: now_ms(),
        },
    }
}

fn invalid_target_ack() -> AckRecord {
    AckRecord {
        ok: false,
        accepted: false,
        queued: false,
        verified: false,
        status: AckStatus::InvalidTarget.as_str().to_owned(),
        ws_delivery_count: 0,
        ack_latency_ms: 0,
        error: None,
        dedupe: None,
        handler_result: None,
    }
}

fn finish(mut record: AckRecord, started: Instant) -> AckRecord {
    record.ack_latency_ms = started.elapsed().as_millis() as u64;
    metrics::histogram!("comms.ack.latency").record(record.ack_latency_ms as f64);
    record
}

fn ack_frame(message_id: Option<String>, record: AckRecord, trace: &TraceContext) -> ServerFrame {
    ServerFrame::SendAck {
        message_id,
        ack: record,
        trace_id: trace.trace_id.clone(),
        timestamp: now_ms(),
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
