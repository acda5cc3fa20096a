// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The local WebSocket hub.
//!
//! One axum route (`/ws`) accepts agent connections on loopback. Each
//! connection gets a `welcome`, then a read loop that enforces the frame
//! size cap and a per-connection sliding-window rate limit before
//! anything touches the dispatcher. `register` frames flush the offline
//! queue toward the new client; `health-check` and `delivery-check` are
//! answered synchronously.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dedup::DeliveryState;
use crate::dispatch::{Dispatcher, Submission, SubmissionKind};
use crate::error::AckStatus;
use crate::proto::{
    decode, AckRecord, ClientFrame, Decoded, Priority, ServerFrame, MAX_FRAME_BYTES,
};
use crate::queue::{entry_matches, OutboundQueue, QueueEntry};
use crate::registry::{Registry, TouchSource, DEFAULT_STALE_AFTER_MS};
use crate::trace::{now_ms, TraceContext};

/// Sliding-window rate limit: at most this many frames per window.
pub const RATE_LIMIT_MAX_FRAMES: usize = 50;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Shared hub state handed to every connection task.
pub struct HubState {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<OutboundQueue>,
    pub shutdown: CancellationToken,
}

/// Build the hub router.
pub fn router(state: Arc<HubState>) -> Router {
    Router::new().route("/ws", any(ws_handler)).with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<HubState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

/// Per-connection event loop. Owns both halves of the socket: inbound
/// frames are processed in receive order, outbound frames drain from the
/// client's channel.
async fn handle_connection(state: Arc<HubState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let conn_id = state.registry.add(tx.clone()).await;
    let mut limiter = RateLimiter::new(RATE_LIMIT_MAX_FRAMES, RATE_LIMIT_WINDOW);

    if send_json(&mut ws_tx, &ServerFrame::Welcome { client_id: conn_id }).await.is_err() {
        state.registry.close(conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "shutting down".into(),
                    })))
                    .await;
                break;
            }

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if send_json(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        // Protocol limits first; rejected frames never
                        // touch the dedup caches.
                        if text.len() > MAX_FRAME_BYTES {
                            let _ = tx.send(error_frame("Frame exceeds size limit", None));
                            continue;
                        }
                        if !limiter.allow(Instant::now()) {
                            debug!(conn_id, "rate limit exceeded");
                            let _ = tx.send(error_frame("Rate limit exceeded", None));
                            continue;
                        }
                        match decode(&text) {
                            Decoded::Frame(frame) => {
                                handle_frame(&state, conn_id, &tx, frame).await;
                            }
                            Decoded::Text { .. } => {
                                let _ = tx.send(error_frame("Unrecognized frame", None));
                            }
                            Decoded::Invalid { request_id } => {
                                let _ = tx.send(error_frame(
                                    "Missing or unknown frame type",
                                    request_id,
                                ));
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {} // ping/pong/binary ignored
                }
            }
        }
    }

    state.registry.close(conn_id).await;
}

async fn handle_frame(
    state: &Arc<HubState>,
    conn_id: u64,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Register { role, pane_id } => {
            let (role, pane) = state
                .registry
                .register(conn_id, role.as_deref(), pane_id.as_deref())
                .await;
            let _ = tx.send(ServerFrame::Registered {
                role: role.map(|r| r.as_str().to_owned()),
                pane_id: pane.clone(),
            });

            // Replay anything parked for this role/pane before the client
            // can observe its own registration.
            let flushed = state.queue.flush_for_client(role, pane.as_deref(), "register", |entry| {
                tx.send(replay_frame(entry)).is_ok()
            });
            if flushed > 0 {
                info!(conn_id, flushed, "replayed queued messages to new registration");
            }
        }

        ClientFrame::Send {
            target,
            content,
            priority,
            message_id,
            ack_required,
            metadata,
            trace_context,
        } => {
            state.registry.touch(conn_id, TouchSource::Message).await;
            if content.len() > MAX_FRAME_BYTES {
                let _ = tx.send(oversize_ack(message_id, trace_context.as_ref()));
                return;
            }
            let submission = Submission {
                kind: SubmissionKind::Send { target },
                content,
                priority,
                message_id,
                ack_required,
                metadata,
                trace_context,
                received_at: Instant::now(),
            };
            let ack = state.dispatcher.submit(conn_id, submission).await;
            let _ = tx.send(ack);
        }

        ClientFrame::Broadcast { content, message_id, ack_required, metadata, trace_context } => {
            state.registry.touch(conn_id, TouchSource::Message).await;
            if content.len() > MAX_FRAME_BYTES {
                let _ = tx.send(oversize_ack(message_id, trace_context.as_ref()));
                return;
            }
            let submission = Submission {
                kind: SubmissionKind::Broadcast,
                content,
                priority: Priority::Normal,
                message_id,
                ack_required,
                metadata,
                trace_context,
                received_at: Instant::now(),
            };
            let ack = state.dispatcher.submit(conn_id, submission).await;
            let _ = tx.send(ack);
        }

        ClientFrame::HealthCheck { target, stale_after_ms, request_id } => {
            state.registry.touch(conn_id, TouchSource::HealthCheck).await;
            let threshold = stale_after_ms.unwrap_or(DEFAULT_STALE_AFTER_MS);
            let health = state.registry.route_health(&target, threshold).await;
            let _ = tx.send(ServerFrame::HealthCheckResult {
                target,
                healthy: health.healthy,
                status: health.status.to_owned(),
                last_seen: health.last_seen,
                age_ms: health.age_ms,
                stale_threshold_ms: threshold,
                role: health.role,
                pane_id: health.pane_id,
                request_id,
            });
        }

        ClientFrame::DeliveryCheck { message_id, request_id } => {
            let reply = match state.dispatcher.cache().delivery_state(message_id.trim()) {
                DeliveryState::Known(ack) => ServerFrame::DeliveryCheckResult {
                    known: true,
                    message_id,
                    status: Some(ack.status.clone()),
                    ack: Some(ack),
                    pending: None,
                    request_id,
                },
                DeliveryState::Pending => ServerFrame::DeliveryCheckResult {
                    known: true,
                    message_id,
                    status: None,
                    ack: None,
                    pending: Some(true),
                    request_id,
                },
                DeliveryState::Unknown => ServerFrame::DeliveryCheckResult {
                    known: false,
                    message_id,
                    status: None,
                    ack: None,
                    pending: None,
                    request_id,
                },
            };
            let _ = tx.send(reply);
        }

        ClientFrame::Heartbeat {} => {
            // Liveness only; any inbound frame counts, so no reply.
            state.registry.touch(conn_id, TouchSource::Message).await;
        }
    }
}

/// Rebuild a `message` frame from a parked queue entry.
fn replay_frame(entry: &QueueEntry) -> ServerFrame {
    let trace = TraceContext::derive(entry.meta.trace_context.as_ref());
    ServerFrame::Message {
        from: entry.meta.sender_role.clone().unwrap_or_else(|| "unknown".to_owned()),
        priority: entry.meta.priority,
        content: entry.content.clone(),
        metadata: entry.meta.metadata.clone(),
        trace_id: trace.trace_id,
        parent_event_id: trace.parent_event_id,
        event_id: trace.event_id,
        timestamp: now_ms(),
    }
}

fn error_frame(message: &str, request_id: Option<String>) -> ServerFrame {
    ServerFrame::Error { message: message.to_owned(), pane_id: None, request_id }
}

fn oversize_ack(message_id: Option<String>, trace: Option<&TraceContext>) -> ServerFrame {
    let trace = TraceContext::derive(trace);
    ServerFrame::SendAck {
        message_id,
        ack: AckRecord {
            ok: false,
            accepted: false,
            queued: false,
            verified: false,
            status: AckStatus::Oversize.as_str().to_owned(),
            ws_delivery_count: 0,
            ack_latency_ms: 0,
            error: Some("content exceeds 256 KiB".to_owned()),
            dedupe: None,
            handler_result: None,
        },
        trace_id: trace.trace_id,
        timestamp: now_ms(),
    }
}

async fn send_json<S>(tx: &mut S, frame: &ServerFrame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(t) => t,
        Err(_) => return Err(()),
    };
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Per-connection sliding-window limiter.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self { max, window, hits: VecDeque::with_capacity(max) }
    }

    /// Record an arrival; returns false when the window is full.
    pub fn allow(&mut self, now: Instant) -> bool {
        while self.hits.front().is_some_and(|&t| now.duration_since(t) >= self.window) {
            self.hits.pop_front();
        }
        if self.hits.len() >= self.max {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

/// Timer-driven retry of the whole queue: entries whose target has come
/// back (by role or pane) are replayed.
pub async fn run_queue_flush(
    queue: Arc<OutboundQueue>,
    registry: Arc<Registry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                debug!("queue flush timer shutting down");
                return;
            }
        }
        let clients = registry.all().await;
        if clients.is_empty() {
            continue;
        }
        queue.flush_all("timer", |entry| {
            clients
                .iter()
                .find(|c| entry_matches(&entry.target, c.role, c.pane_id.as_deref()))
                .map(|c| c.tx.send(replay_frame(entry)).is_ok())
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
