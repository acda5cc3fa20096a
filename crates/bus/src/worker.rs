// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker-process isolation.
//!
//! In worker mode the hub runs in a child process (`switchboard worker`)
//! so TCP and JSON-parsing faults cannot take the controller down. The
//! parent and child speak newline-delimited JSON over the child's stdio:
//! the child forwards handler deliveries up as requests and waits for
//! the verdict with a 15 s timeout; the child exits when the parent's
//! pipe closes. Treat this channel as another bridge, not a replacement
//! for the in-process seams.

use std::collections::HashMap;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::handler::{HandlerDelivery, HandlerVerdict, MessageHandler};
use crate::supervisor::{CoreConfig, Supervisor};

/// How long the worker waits for the parent to answer one delivery.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Child → parent lines.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    Ready { addr: String },
    StartFailed { error: String },
    OnMessage { id: u64, delivery: HandlerDelivery },
}

/// Parent → child lines.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostCommand {
    OnMessageResult {
        id: u64,
        #[serde(default)]
        verdict: Option<HandlerVerdict>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Parent-side handle to a running worker child.
pub struct WorkerProcess {
    child: tokio::process::Child,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    addr: SocketAddr,
}

/// The worker binary: this executable, unless `SWITCHBOARD_WORKER_BIN`
/// names another one (hosts that embed the core in a binary without the
/// `worker` subcommand need the override).
fn worker_binary() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os("SWITCHBOARD_WORKER_BIN") {
        return Ok(PathBuf::from(path));
    }
    std::env::current_exe().context("resolve worker binary")
}

/// Command line for the worker child. Every operator-visible knob in the
/// parent's core config must round-trip through here, or the child runs
/// with compiled-in defaults instead.
fn worker_args(config: &CoreConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "worker".into(),
        "--port".into(),
        config.port.to_string().into(),
        "--session-scope".into(),
        config.session_scope.clone().into(),
        "--queue-max-entries".into(),
        config.queue_max_entries.to_string().into(),
        "--queue-max-age-ms".into(),
        config.queue_max_age.as_millis().to_string().into(),
        "--queue-flush-interval-ms".into(),
        config.queue_flush_interval.as_millis().to_string().into(),
        "--dedup-signature-ttl-ms".into(),
        config.dedup_signature_ttl.as_millis().to_string().into(),
    ];
    if let Some(ref path) = config.queue_path {
        args.push("--queue-path".into());
        args.push(path.clone().into_os_string());
    }
    if let Some(ref bridge) = config.bridge {
        args.push("--bridge-url".into());
        args.push(bridge.url.clone().into());
        args.push("--device-id".into());
        args.push(bridge.device_id.clone().into());
        args.push("--bridge-reconnect-base-ms".into());
        args.push(bridge.reconnect_base.as_millis().to_string().into());
        args.push("--bridge-reconnect-max-ms".into());
        args.push(bridge.reconnect_max.as_millis().to_string().into());
        if let Some(ref secret) = bridge.shared_secret {
            args.push("--bridge-secret".into());
            args.push(secret.clone().into());
        }
    }
    args
}

impl WorkerProcess {
    /// Spawn `switchboard worker` and wait for its `ready` line.
    pub async fn spawn(
        config: &CoreConfig,
        handler: Option<MessageHandler>,
    ) -> anyhow::Result<Self> {
        let exe = worker_binary()?;
        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(worker_args(config));
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("spawn comms worker process")?;
        let stdout = child.stdout.take().context("worker stdout unavailable")?;
        let mut stdin = child.stdin.take().context("worker stdin unavailable")?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            // Channel closed: dropping stdin signals the child to exit.
        });

        let (ready_tx, ready_rx) = oneshot::channel::<Result<String, String>>();
        let reader_stdin_tx = stdin_tx.clone();
        let reader = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let event = match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(e) => e,
                    Err(_) => {
                        debug!(line = %line, "ignoring non-protocol worker output");
                        continue;
                    }
                };
                match event {
                    WorkerEvent::Ready { addr } => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(addr));
                        }
                    }
                    WorkerEvent::StartFailed { error } => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(error));
                        }
                    }
                    WorkerEvent::OnMessage { id, delivery } => {
                        let handler = handler.clone();
                        let stdin_tx = reader_stdin_tx.clone();
                        tokio::spawn(async move {
                            let (verdict, error) = match handler {
                                Some(h) => match h(delivery).await {
                                    Ok(v) => (v, None),
                                    Err(e) => (None, Some(e.to_string())),
                                },
                                None => (None, None),
                            };
                            if let Ok(line) = serde_json::to_string(&HostCommand::OnMessageResult {
                                id,
                                verdict,
                                error,
                            }) {
                                let _ = stdin_tx.send(line);
                            }
                        });
                    }
                }
            }
            debug!("worker stdout closed");
        });

        let addr = tokio::time::timeout(CALLBACK_TIMEOUT, ready_rx)
            .await
            .context("worker did not report ready")?
            .context("worker exited before ready")?
            .map_err(anyhow::Error::msg)?;
        let addr: SocketAddr = addr.parse().context("parse worker address")?;

        info!(%addr, pid = child.id(), "comms worker ready");
        Ok(Self { child, stdin_tx: Some(stdin_tx), tasks: vec![writer, reader], addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close the IPC channel and wait for the child to exit.
    pub async fn stop(mut self) {
        // The reader task holds a sender clone, so both IPC tasks must go
        // before the writer's stdin handle drops and the child sees EOF.
        drop(self.stdin_tx.take());
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "worker exited"),
            _ => {
                warn!("worker did not exit on disconnect, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}

type PendingVerdict = oneshot::Sender<(Option<HandlerVerdict>, Option<String>)>;

/// Child-side entrypoint: run the hub in-process and proxy every handler
/// delivery to the parent over stdout.
pub async fn run(config: CoreConfig) -> anyhow::Result<()> {
    let pending: Arc<Mutex<HashMap<u64, PendingVerdict>>> = Arc::new(Mutex::new(HashMap::new()));
    let next_id = Arc::new(AtomicU64::new(1));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let stdout_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let handler: MessageHandler = {
        let pending = Arc::clone(&pending);
        let next_id = Arc::clone(&next_id);
        let out_tx = out_tx.clone();
        Arc::new(move |delivery| {
            let pending = Arc::clone(&pending);
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let out_tx = out_tx.clone();
            Box::pin(async move {
                let (tx, rx) = oneshot::channel();
                pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);

                let line = serde_json::to_string(&WorkerEvent::OnMessage { id, delivery })
                    .context("encode delivery for host")?;
                if out_tx.send(line).is_err() {
                    pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                    anyhow::bail!("host channel closed");
                }

                match tokio::time::timeout(CALLBACK_TIMEOUT, rx).await {
                    Ok(Ok((verdict, None))) => Ok(verdict),
                    Ok(Ok((_, Some(error)))) => Err(anyhow::anyhow!(error)),
                    Ok(Err(_)) => anyhow::bail!("host dropped the delivery"),
                    Err(_) => {
                        pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                        anyhow::bail!("host callback timed out")
                    }
                }
            })
        })
    };

    let supervisor = Supervisor::new();
    let mut core_config = config;
    core_config.worker = false;
    match supervisor.start(core_config, Some(handler)).await {
        Ok(addr) => {
            let line = serde_json::to_string(&WorkerEvent::Ready { addr: addr.to_string() })
                .unwrap_or_default();
            let _ = out_tx.send(line);
        }
        Err(e) => {
            let line =
                serde_json::to_string(&WorkerEvent::StartFailed { error: format!("{e:#}") })
                    .unwrap_or_default();
            let _ = out_tx.send(line);
            return Err(e);
        }
    }

    // Commands arrive on stdin; EOF means the parent is gone.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<HostCommand>(&line) {
            Ok(HostCommand::OnMessageResult { id, verdict, error }) => {
                let waiter =
                    pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send((verdict, error));
                } else {
                    debug!(id, "verdict for unknown or timed-out delivery");
                }
            }
            Err(_) => debug!("ignoring malformed host command"),
        }
    }

    info!("host disconnected, shutting down worker");
    supervisor.stop().await;
    stdout_task.abort();
    let _ = stdout_task.await;
    Ok(())
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
