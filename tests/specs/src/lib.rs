// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end bus and bridge scenarios.
//!
//! Starts a real comms core on an ephemeral loopback port, drives it
//! with plain tokio-tungstenite WebSocket clients, and provides a fake
//! relay for bridge round-trips.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use switchboard::handler::MessageHandler;
use switchboard::supervisor::{CoreConfig, Supervisor};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve the compiled `switchboard` binary.
pub fn switchboard_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("switchboard")
}

/// A running comms core (in-process or worker-isolated).
pub struct TestBus {
    pub supervisor: Supervisor,
    pub addr: SocketAddr,
    /// Keeps worker-mode scratch state alive for the bus's lifetime.
    pub scratch: Option<tempfile::TempDir>,
}

impl TestBus {
    pub async fn start(scope: &str, queue_path: Option<PathBuf>) -> anyhow::Result<Self> {
        Self::start_with(scope, queue_path, None).await
    }

    pub async fn start_with(
        scope: &str,
        queue_path: Option<PathBuf>,
        handler: Option<MessageHandler>,
    ) -> anyhow::Result<Self> {
        let supervisor = Supervisor::new();
        let addr = supervisor.start(core_config(scope, queue_path, false), handler).await?;
        Ok(Self { supervisor, addr, scratch: None })
    }

    /// Start the core with the hub isolated in a real worker child
    /// process, speaking the stdio protocol to this test.
    pub async fn start_worker(
        scope: &str,
        handler: Option<MessageHandler>,
    ) -> anyhow::Result<Self> {
        // The test harness executable has no `worker` subcommand, so the
        // child must be the real binary built alongside this suite.
        std::env::set_var("SWITCHBOARD_WORKER_BIN", switchboard_binary());
        let scratch = tempfile::tempdir().context("create worker scratch dir")?;
        let queue_path = scratch.path().join("comms-outbound-queue.json");

        let supervisor = Supervisor::new();
        let addr =
            supervisor.start(core_config(scope, Some(queue_path), true), handler).await?;
        Ok(Self { supervisor, addr, scratch: Some(scratch) })
    }

    pub async fn connect(&self) -> anyhow::Result<WsClient> {
        WsClient::connect(self.addr).await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }
}

fn core_config(scope: &str, queue_path: Option<PathBuf>, worker: bool) -> CoreConfig {
    CoreConfig {
        port: 0,
        session_scope: scope.to_owned(),
        queue_path,
        queue_max_entries: 500,
        queue_max_age: Duration::from_secs(1800),
        // Short timer so flush-on-reconnect scenarios finish quickly.
        queue_flush_interval: Duration::from_millis(200),
        dedup_signature_ttl: Duration::from_secs(15),
        bridge: None,
        worker,
    }
}

/// One agent connection speaking raw JSON frames.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .context("connect to hub")?;
        Ok(Self { stream })
    }

    pub async fn send_json(&mut self, frame: &Value) -> anyhow::Result<()> {
        let text = serde_json::to_string(frame)?;
        self.stream.send(Message::Text(text.into())).await.context("ws send")
    }

    /// Next JSON frame, skipping non-text messages.
    pub async fn recv_json(&mut self) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .context("timed out waiting for a frame")?
                .context("connection closed")??;
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).context("frame is not JSON");
            }
        }
    }

    /// Read frames until one with the given `type` arrives.
    pub async fn recv_type(&mut self, frame_type: &str) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("no `{frame_type}` frame within timeout");
            }
            let frame = self.recv_json().await?;
            if frame["type"] == frame_type {
                return Ok(frame);
            }
        }
    }

    /// True if a frame of the given type arrives within `wait`.
    pub async fn sees_type_within(&mut self, frame_type: &str, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next = tokio::time::timeout_at(deadline, self.stream.next()).await;
            let Ok(Some(Ok(Message::Text(text)))) = next else {
                return false;
            };
            if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                if frame["type"] == frame_type {
                    return true;
                }
            }
        }
    }

    /// Consume the `welcome` frame and register a role.
    pub async fn register(&mut self, role: &str) -> anyhow::Result<Value> {
        self.recv_type("welcome").await?;
        self.send_json(&json!({ "type": "register", "role": role })).await?;
        self.recv_type("registered").await
    }
}

/// Behavior knobs for the fake relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Answer `xsend` with an `xack` at all.
    pub answer_sends: bool,
    pub ack_ok: bool,
    pub ack_status: Option<String>,
    /// Reply to `xdiscovery` with `error{unsupported_type:xdiscovery}`.
    pub discovery_unsupported: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            answer_sends: true,
            ack_ok: true,
            ack_status: Some("bridge_delivered".to_owned()),
            discovery_unsupported: false,
        }
    }
}

struct RelayShared {
    options: RelayOptions,
    frames: Mutex<Vec<Value>>,
    to_client: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

/// A minimal relay: acks registration, optionally acks sends, answers
/// discovery, and can push `xdeliver` frames to the connected device.
pub struct FakeRelay {
    pub addr: SocketAddr,
    shared: Arc<RelayShared>,
    shutdown: CancellationToken,
}

impl FakeRelay {
    pub async fn start(options: RelayOptions) -> anyhow::Result<Self> {
        let shared = Arc::new(RelayShared {
            options,
            frames: Mutex::new(Vec::new()),
            to_client: Mutex::new(None),
        });
        let shutdown = CancellationToken::new();

        let router = Router::new().route("/ws", any(relay_ws)).with_state(Arc::clone(&shared));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
        });

        Ok(Self { addr, shared, shutdown })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Every frame the relay has received, oldest first.
    pub fn frames(&self) -> Vec<Value> {
        self.shared.frames.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until a frame of the given type has been received.
    pub async fn wait_for_frame(&self, frame_type: &str) -> anyhow::Result<Value> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Some(frame) =
                self.frames().into_iter().find(|f| f["type"] == frame_type)
            {
                return Ok(frame);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("relay never received `{frame_type}`");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Push a frame to the connected device.
    pub async fn push(&self, frame: &Value) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let tx = self
                .shared
                .to_client
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(tx) = tx {
                tx.send(serde_json::to_string(frame)?).context("relay push")?;
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("no device connected to the relay");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn relay_ws(
    State(shared): State<Arc<RelayShared>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_connection(shared, socket))
}

async fn relay_connection(shared: Arc<RelayShared>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *shared.to_client.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

    loop {
        tokio::select! {
            out = rx.recv() => {
                let Some(text) = out else { break };
                if ws_tx.send(AxumMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(AxumMessage::Text(text))) = msg else { break };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                shared
                    .frames
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(frame.clone());

                let reply = match frame["type"].as_str() {
                    Some("register") => Some(json!({ "type": "register-ack", "ok": true })),
                    Some("xsend") if shared.options.answer_sends => Some(json!({
                        "type": "xack",
                        "messageId": frame["messageId"],
                        "ok": shared.options.ack_ok,
                        "status": shared.options.ack_status,
                    })),
                    Some("xdiscovery") => {
                        if shared.options.discovery_unsupported {
                            Some(json!({
                                "type": "error",
                                "message": "unsupported_type:xdiscovery",
                            }))
                        } else {
                            Some(json!({
                                "type": "xdiscovery-result",
                                "requestId": frame["requestId"],
                                "devices": [
                                    { "deviceId": "ZULU", "roles": ["architect"], "connectedSince": 1 },
                                    { "deviceId": "ALPHA", "roles": ["architect"], "connectedSince": 2 },
                                ],
                            }))
                        }
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    let Ok(text) = serde_json::to_string(&reply) else { continue };
                    if ws_tx.send(AxumMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
