// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide lifecycle for the comms core.
//!
//! `start` is idempotent: a second caller gets the running core's
//! address, and concurrent starts serialize behind a single in-flight
//! future. `stop` cancels every task, closes client connections with
//! code 1000, and returns only after the listener and timers are gone.
//! A later `start` restores the queue from disk (the session-scope gate
//! applies).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::{BridgeClient, BridgeConfig, InboundHandler};
use crate::dedup::AckCache;
use crate::dispatch::{Dispatcher, Submission, SubmissionKind};
use crate::handler::{HandlerVerdict, MessageHandler};
use crate::hub::{self, HubState};
use crate::proto::{Priority, ServerFrame};
use crate::queue::OutboundQueue;
use crate::registry::Registry;
use crate::worker::WorkerProcess;

/// Everything the core needs to come up.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Loopback port; 0 binds an ephemeral port.
    pub port: u16,
    pub session_scope: String,
    pub queue_path: Option<PathBuf>,
    pub queue_max_entries: usize,
    pub queue_max_age: Duration,
    pub queue_flush_interval: Duration,
    pub dedup_signature_ttl: Duration,
    pub bridge: Option<BridgeConfig>,
    /// Run the hub in a child process and speak JSON over its stdio.
    pub worker: bool,
}

/// Handles into a running in-process core, for host integration.
#[derive(Clone)]
pub struct CoreHandles {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<OutboundQueue>,
    pub bridge: Option<Arc<BridgeClient>>,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    core: Option<CoreHandles>,
    worker: Option<WorkerProcess>,
}

type StartSignal = Option<Result<SocketAddr, String>>;

#[derive(Default)]
struct SupervisorState {
    running: Option<Running>,
    starting: Option<watch::Receiver<StartSignal>>,
}

enum StartAction {
    AlreadyRunning(SocketAddr),
    AwaitOther(watch::Receiver<StartSignal>),
    Run(watch::Sender<StartSignal>),
}

/// Owns start/stop of the whole comms core.
#[derive(Default)]
pub struct Supervisor {
    state: tokio::sync::Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the core up (idempotent). Returns the bound address.
    pub async fn start(
        &self,
        config: CoreConfig,
        handler: Option<MessageHandler>,
    ) -> anyhow::Result<SocketAddr> {
        loop {
            let action = {
                let mut state = self.state.lock().await;
                if let Some(ref running) = state.running {
                    StartAction::AlreadyRunning(running.addr)
                } else if let Some(ref rx) = state.starting {
                    StartAction::AwaitOther(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    state.starting = Some(rx);
                    StartAction::Run(tx)
                }
            };

            match action {
                StartAction::AlreadyRunning(addr) => return Ok(addr),
                StartAction::AwaitOther(mut rx) => {
                    loop {
                        let settled = rx.borrow().clone();
                        if let Some(result) = settled {
                            return result.map_err(anyhow::Error::msg);
                        }
                        if rx.changed().await.is_err() {
                            // The starter died without publishing; retry.
                            break;
                        }
                    }
                }
                StartAction::Run(tx) => {
                    let result = do_start(&config, handler).await;
                    let mut state = self.state.lock().await;
                    state.starting = None;
                    return match result {
                        Ok(running) => {
                            let addr = running.addr;
                            state.running = Some(running);
                            drop(state);
                            tx.send_replace(Some(Ok(addr)));
                            Ok(addr)
                        }
                        Err(e) => {
                            drop(state);
                            tx.send_replace(Some(Err(format!("{e:#}"))));
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Tear the core down. Returns after every task has released.
    pub async fn stop(&self) {
        let running = { self.state.lock().await.running.take() };
        let Some(mut running) = running else {
            return;
        };

        if let Some(worker) = running.worker.take() {
            worker.stop().await;
        }
        if let Some(ref core) = running.core {
            if let Some(ref bridge) = core.bridge {
                bridge.stop();
            }
        }
        running.shutdown.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        info!("comms core stopped");
    }

    pub async fn addr(&self) -> Option<SocketAddr> {
        self.state.lock().await.running.as_ref().map(|r| r.addr)
    }

    /// In-process core handles; `None` when stopped or in worker mode.
    pub async fn core(&self) -> Option<CoreHandles> {
        self.state.lock().await.running.as_ref().and_then(|r| r.core.clone())
    }
}

async fn do_start(config: &CoreConfig, handler: Option<MessageHandler>) -> anyhow::Result<Running> {
    if config.worker {
        let worker = WorkerProcess::spawn(config, handler).await?;
        let addr = worker.addr();
        info!(%addr, "comms core running in worker process");
        return Ok(Running {
            addr,
            shutdown: CancellationToken::new(),
            tasks: vec![],
            core: None,
            worker: Some(worker),
        });
    }

    let shutdown = CancellationToken::new();
    let registry = Arc::new(Registry::new());
    let cache = Arc::new(AckCache::new(config.dedup_signature_ttl));
    let queue = Arc::new(OutboundQueue::new(
        config.queue_path.clone(),
        &config.session_scope,
        config.queue_max_entries,
        config.queue_max_age,
    ));
    queue.load_from_disk();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&queue),
        handler,
    ));

    let bridge = config.bridge.clone().map(|bridge_config| {
        BridgeClient::start(bridge_config, inbound_to_local(Arc::clone(&dispatcher)))
    });

    let listener = TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("bind hub port {}", config.port))?;
    let addr = listener.local_addr().context("resolve hub address")?;

    let hub_state = Arc::new(HubState {
        registry: Arc::clone(&registry),
        dispatcher: Arc::clone(&dispatcher),
        queue: Arc::clone(&queue),
        shutdown: shutdown.clone(),
    });

    let mut tasks = Vec::new();
    let router = hub::router(hub_state);
    let sd = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) =
            axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await
        {
            tracing::error!(err = %e, "hub server failed");
        }
    }));

    tasks.push(tokio::spawn(hub::run_queue_flush(
        Arc::clone(&queue),
        Arc::clone(&registry),
        config.queue_flush_interval,
        shutdown.clone(),
    )));

    let pruner_cache = Arc::clone(&cache);
    let sd = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        pruner_cache.run_pruner(sd).await;
    }));

    info!(%addr, scope = %config.session_scope, "hub listening");
    Ok(Running {
        addr,
        shutdown,
        tasks,
        core: Some(CoreHandles { registry, dispatcher, queue, bridge }),
        worker: None,
    })
}

/// Inbound bridge deliveries are dispatched onto the local bus; the
/// resulting ack becomes the relay's `xack` verdict. Which roles may be
/// addressed from a peer is the host handler's call, not the bridge's.
fn inbound_to_local(dispatcher: Arc<Dispatcher>) -> InboundHandler {
    Arc::new(move |delivery| {
        let dispatcher = Arc::clone(&dispatcher);
        Box::pin(async move {
            let target = delivery
                .target_role
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "architect".to_owned());

            // Carry the peer's identity through to the delivered frame.
            let mut metadata = delivery.metadata.clone();
            if let Some(obj) = metadata.as_object_mut() {
                if let Some(ref device) = delivery.from_device {
                    obj.insert("fromDevice".to_owned(), serde_json::json!(device));
                }
                if let Some(ref role) = delivery.from_role {
                    obj.insert("fromRole".to_owned(), serde_json::json!(role));
                }
            }

            let submission = Submission {
                kind: SubmissionKind::Send { target },
                content: delivery.content.clone(),
                priority: Priority::Normal,
                message_id: delivery.message_id.clone(),
                ack_required: true,
                metadata: Some(metadata),
                trace_context: None,
                received_at: Instant::now(),
            };
            let ServerFrame::SendAck { ack, .. } = dispatcher.submit(0, submission).await else {
                return Ok(HandlerVerdict::default());
            };
            Ok(HandlerVerdict {
                ok: Some(ack.ok),
                success: None,
                accepted: Some(ack.accepted),
                queued: Some(ack.queued),
                verified: Some(ack.verified),
                status: Some(ack.status),
            })
        })
    })
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
