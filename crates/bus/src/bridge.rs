// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound bridge: one long-lived WebSocket to the cross-device relay.
//!
//! State machine: `disconnected → connecting → connected → registered`.
//! Every outbound `xsend` carries a redacted payload and resolves a
//! future keyed by messageId once the matching `xack` arrives (or the
//! per-send timeout fires, whichever is first). Reconnects use capped
//! exponential backoff; registration with the relay resets it.
//!
//! Routing policy (which roles may cross devices) deliberately lives in
//! the host handler, not here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AckStatus;
use crate::handler::HandlerVerdict;
use crate::redact::{redact_text, redact_value};
use crate::structured::{ensure_structured, normalize_metadata};
use crate::trace::new_message_id;

pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 12_000;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 750;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;

const DISCOVERY_TIMEOUT_MS: u64 = 5_000;

/// Bridge connection settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Relay endpoint (`wss://...`).
    pub url: String,
    /// This device's identity with the relay.
    pub device_id: String,
    /// Pre-shared relay secret.
    pub shared_secret: Option<String>,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub ack_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Registered => "registered",
        }
    }
}

/// Relay wire frames (both directions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    Register {
        device_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        shared_secret: Option<String>,
    },
    RegisterAck {
        #[serde(default)]
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Xsend {
        message_id: String,
        from_device: String,
        to_device: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_role: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_role: Option<String>,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    Xack {
        message_id: String,
        #[serde(default)]
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Xdeliver {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        from_device: Option<String>,
        #[serde(default)]
        from_role: Option<String>,
        #[serde(default)]
        target_role: Option<String>,
        content: String,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    Xdiscovery {
        request_id: String,
    },
    XdiscoveryResult {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        devices: Vec<DeviceInfo>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub connected_since: Option<u64>,
}

/// Outbound send request.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub message_id: Option<String>,
    pub to_device: String,
    pub content: String,
    pub from_role: Option<String>,
    pub target_role: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
}

/// Resolved outcome of one cross-device send. Exactly one of `ok: true`
/// or an error `status` holds; the future never resolves twice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSendResult {
    pub ok: bool,
    pub verified: bool,
    pub status: String,
    pub message_id: String,
    pub from_device: String,
    pub to_device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Device discovery outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub devices: Vec<DeviceInfo>,
}

/// An inbound cross-device delivery handed to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundDelivery {
    pub message_id: Option<String>,
    pub from_device: Option<String>,
    pub from_role: Option<String>,
    pub target_role: Option<String>,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Host callback for `xdeliver` frames; its verdict becomes the `xack`.
pub type InboundHandler = Arc<
    dyn Fn(InboundDelivery) -> BoxFuture<'static, anyhow::Result<HandlerVerdict>> + Send + Sync,
>;

struct PendingAck {
    tx: oneshot::Sender<RelayAckPayload>,
}

#[derive(Debug, Clone)]
struct RelayAckPayload {
    ok: bool,
    status: Option<String>,
    error: Option<String>,
}

pub struct BridgeClient {
    config: BridgeConfig,
    state: RwLock<BridgeState>,
    out_tx: mpsc::UnboundedSender<RelayFrame>,
    pending: Mutex<HashMap<String, PendingAck>>,
    discovery: Mutex<HashMap<String, oneshot::Sender<DiscoveryResult>>>,
    cancel: CancellationToken,
}

impl BridgeClient {
    /// Create the client and start its connection loop.
    pub fn start(config: BridgeConfig, inbound: InboundHandler) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            config,
            state: RwLock::new(BridgeState::Disconnected),
            out_tx,
            pending: Mutex::new(HashMap::new()),
            discovery: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_loop(Arc::clone(&client), out_rx, inbound));
        client
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(from = state.as_str(), to = next.as_str(), "bridge state change");
            *state = next;
        }
    }

    /// Forward one message through the relay. Resolves on the matching
    /// `xack`, on the per-send timeout, or immediately when the bridge
    /// is not registered.
    pub async fn send_to_device(&self, request: SendRequest) -> BridgeSendResult {
        let message_id = request
            .message_id
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(new_message_id);
        let from_device = normalize_device_id(&self.config.device_id);
        let to_device = normalize_device_id(&request.to_device);

        let unresolved = |status: AckStatus, error: Option<String>| BridgeSendResult {
            ok: false,
            verified: false,
            status: status.as_str().to_owned(),
            message_id: message_id.clone(),
            from_device: from_device.clone(),
            to_device: to_device.clone(),
            error,
        };

        if self.state() != BridgeState::Registered {
            return unresolved(AckStatus::BridgeUnavailable, None);
        }

        // Nothing leaves the process unscrubbed.
        let content = redact_text(&request.content);
        let metadata = request.metadata.map(|mut m| {
            normalize_metadata(&mut m);
            redact_value(&mut m);
            m
        });

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id.clone(), PendingAck { tx });

        let frame = RelayFrame::Xsend {
            message_id: message_id.clone(),
            from_device: from_device.clone(),
            to_device: to_device.clone(),
            from_role: request.from_role.clone(),
            target_role: request.target_role.clone(),
            content,
            metadata,
        };
        if self.out_tx.send(frame).is_err() {
            self.take_pending(&message_id);
            return unresolved(AckStatus::BridgeSendFailed, Some("bridge loop stopped".into()));
        }

        let timeout = request.timeout.unwrap_or(self.config.ack_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => BridgeSendResult {
                ok: ack.ok,
                verified: ack.ok,
                status: ack.status.unwrap_or_else(|| {
                    if ack.ok {
                        AckStatus::BridgeDelivered.as_str().to_owned()
                    } else {
                        AckStatus::BridgeSendFailed.as_str().to_owned()
                    }
                }),
                message_id,
                from_device,
                to_device,
                error: ack.error,
            },
            Ok(Err(_)) => unresolved(AckStatus::BridgeSendFailed, Some("ack channel closed".into())),
            Err(_) => {
                self.take_pending(&message_id);
                unresolved(AckStatus::BridgeAckTimeout, None)
            }
        }
    }

    /// Ask the relay which devices are connected.
    pub async fn discover_devices(&self, timeout: Option<Duration>) -> DiscoveryResult {
        if self.state() != BridgeState::Registered {
            return DiscoveryResult {
                ok: false,
                status: Some(AckStatus::BridgeUnavailable.as_str().to_owned()),
                devices: vec![],
            };
        }

        let request_id = new_message_id();
        let (tx, rx) = oneshot::channel();
        self.discovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.clone(), tx);

        if self.out_tx.send(RelayFrame::Xdiscovery { request_id: request_id.clone() }).is_err() {
            self.discovery.lock().unwrap_or_else(PoisonError::into_inner).remove(&request_id);
            return DiscoveryResult {
                ok: false,
                status: Some(AckStatus::BridgeSendFailed.as_str().to_owned()),
                devices: vec![],
            };
        }

        let timeout = timeout.unwrap_or(Duration::from_millis(DISCOVERY_TIMEOUT_MS));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            _ => {
                self.discovery.lock().unwrap_or_else(PoisonError::into_inner).remove(&request_id);
                DiscoveryResult {
                    ok: false,
                    status: Some(AckStatus::BridgeAckTimeout.as_str().to_owned()),
                    devices: vec![],
                }
            }
        }
    }

    /// Stop the connection loop. Every pending future resolves with
    /// `bridge_stopped`.
    pub fn stop(&self) {
        self.cancel.cancel();
        let pending: Vec<PendingAck> = {
            let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, p)| p).collect()
        };
        for p in pending {
            let _ = p.tx.send(RelayAckPayload {
                ok: false,
                status: Some(AckStatus::BridgeStopped.as_str().to_owned()),
                error: None,
            });
        }
        let discovery: Vec<oneshot::Sender<DiscoveryResult>> = {
            let mut map = self.discovery.lock().unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in discovery {
            let _ = tx.send(DiscoveryResult {
                ok: false,
                status: Some(AckStatus::BridgeStopped.as_str().to_owned()),
                devices: vec![],
            });
        }
        self.set_state(BridgeState::Disconnected);
    }

    fn take_pending(&self, message_id: &str) -> Option<PendingAck> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(message_id)
    }

    fn resolve_ack(&self, message_id: &str, payload: RelayAckPayload) {
        if let Some(pending) = self.take_pending(message_id) {
            let _ = pending.tx.send(payload);
        } else {
            debug!(message_id, "xack for unknown or already-resolved send");
        }
    }

    fn resolve_discovery(&self, request_id: Option<&str>, mut devices: Vec<DeviceInfo>) {
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let mut map = self.discovery.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = match request_id {
            Some(rid) => map.remove(rid),
            // Some relays omit the request id; resolve the oldest waiter.
            None => map.keys().next().cloned().and_then(|k| map.remove(&k)),
        };
        drop(map);
        if let Some(tx) = tx {
            let _ = tx.send(DiscoveryResult { ok: true, status: None, devices });
        }
    }

    fn fail_discovery_unsupported(&self) {
        let waiters: Vec<oneshot::Sender<DiscoveryResult>> = {
            let mut map = self.discovery.lock().unwrap_or_else(PoisonError::into_inner);
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(DiscoveryResult {
                ok: false,
                status: Some(AckStatus::BridgeDiscoveryUnsupported.as_str().to_owned()),
                devices: vec![],
            });
        }
    }
}

/// Device IDs are uppercased and restricted to `[A-Z0-9_-]`.
pub fn normalize_device_id(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

async fn run_loop(
    client: Arc<BridgeClient>,
    mut out_rx: mpsc::UnboundedReceiver<RelayFrame>,
    inbound: InboundHandler,
) {
    let mut attempt = 0u32;

    loop {
        if client.cancel.is_cancelled() {
            break;
        }

        client.set_state(BridgeState::Connecting);
        match tokio_tungstenite::connect_async(&client.config.url).await {
            Ok((stream, _)) => {
                client.set_state(BridgeState::Connected);
                let (mut write, mut read) = stream.split();

                let register = RelayFrame::Register {
                    device_id: normalize_device_id(&client.config.device_id),
                    shared_secret: client.config.shared_secret.clone(),
                };
                if write_frame(&mut write, &register).await.is_err() {
                    warn!("relay register write failed");
                } else {
                    loop {
                        tokio::select! {
                            _ = client.cancel.cancelled() => {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }

                            frame = out_rx.recv() => {
                                match frame {
                                    Some(frame) => {
                                        if write_frame(&mut write, &frame).await.is_err() {
                                            debug!("relay write failed");
                                            break;
                                        }
                                    }
                                    None => return, // client dropped
                                }
                            }

                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        let Ok(frame) = serde_json::from_str::<RelayFrame>(&text) else {
                                            debug!("unparseable relay frame ignored");
                                            continue;
                                        };
                                        if handle_relay_frame(&client, frame, &inbound).is_break() {
                                            break;
                                        }
                                        if client.state() == BridgeState::Registered {
                                            attempt = 0;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | None => {
                                        debug!("relay connection closed");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        debug!(err = %e, "relay read error");
                                        break;
                                    }
                                    _ => {} // ping/pong/binary ignored
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!(err = %e, attempt, "relay connect failed");
            }
        }

        client.set_state(BridgeState::Disconnected);
        attempt = attempt.saturating_add(1);
        metrics::counter!("comms.bridge.reconnects").increment(1);

        let backoff = reconnect_backoff(
            attempt,
            client.config.reconnect_base,
            client.config.reconnect_max,
        );
        tokio::select! {
            _ = client.cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

fn handle_relay_frame(
    client: &Arc<BridgeClient>,
    frame: RelayFrame,
    inbound: &InboundHandler,
) -> std::ops::ControlFlow<()> {
    match frame {
        RelayFrame::RegisterAck { ok: true, .. } => {
            info!(device = %normalize_device_id(&client.config.device_id), "registered with relay");
            client.set_state(BridgeState::Registered);
        }
        RelayFrame::RegisterAck { ok: false, error } => {
            warn!(error = error.as_deref().unwrap_or("unknown"), "relay rejected registration");
            return std::ops::ControlFlow::Break(());
        }
        RelayFrame::Xack { message_id, ok, status, error } => {
            client.resolve_ack(&message_id, RelayAckPayload { ok, status, error });
        }
        RelayFrame::Xdeliver { message_id, from_device, from_role, target_role, content, metadata } => {
            let client = Arc::clone(client);
            let inbound = Arc::clone(inbound);
            tokio::spawn(async move {
                handle_inbound(
                    &client,
                    InboundDelivery {
                        message_id,
                        from_device,
                        from_role,
                        target_role,
                        metadata: ensure_structured(metadata, &content),
                        content,
                    },
                    inbound,
                )
                .await;
            });
        }
        RelayFrame::XdiscoveryResult { request_id, devices } => {
            client.resolve_discovery(request_id.as_deref(), devices);
        }
        RelayFrame::Error { message } => {
            if message.contains("unsupported_type:xdiscovery") {
                client.fail_discovery_unsupported();
            } else {
                warn!(message = %message, "relay error frame");
            }
        }
        // Register/Xsend/Xdiscovery are outbound-only; a relay echoing
        // them back is ignored.
        _ => {}
    }
    std::ops::ControlFlow::Continue(())
}

/// Deliver an inbound cross-device message to the host and reply with an
/// `xack` carrying the host's verdict.
async fn handle_inbound(
    client: &Arc<BridgeClient>,
    delivery: InboundDelivery,
    inbound: InboundHandler,
) {
    let message_id = delivery.message_id.clone().unwrap_or_else(new_message_id);
    let ack = match inbound(delivery).await {
        Ok(verdict) => RelayFrame::Xack {
            message_id,
            ok: verdict.effective_ok(),
            status: Some(
                verdict
                    .status
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| AckStatus::BridgeDelivered.as_str().to_owned()),
            ),
            error: None,
        },
        Err(e) => RelayFrame::Xack {
            message_id,
            ok: false,
            status: Some(AckStatus::BridgeHandlerError.as_str().to_owned()),
            error: Some(e.to_string()),
        },
    };
    let _ = client.out_tx.send(ack);
}

async fn write_frame<S>(write: &mut S, frame: &RelayFrame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(frame) {
        Ok(t) => t,
        Err(_) => return Err(()),
    };
    write.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// `min(maxMs, baseMs * 2^(attempt-1))`.
pub fn reconnect_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exp)).min(max)
}

#[cfg(test)]
impl BridgeClient {
    pub(crate) fn force_state(&self, state: BridgeState) {
        self.set_state(state);
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
