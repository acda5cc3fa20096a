// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Two-tier ACK cache with in-flight dedup.
//!
//! Tier one remembers recent ACKs by caller-supplied messageId (honest
//! retries). Tier two remembers them by a content signature (client bugs
//! that mint a fresh messageId for an unchanged payload). A pending
//! future is installed per key before dispatch, so a retry that arrives
//! while the original is in flight awaits it instead of re-dispatching.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::proto::{AckRecord, DedupeInfo, DedupeMode};

/// TTL for the by-messageId tier.
const ID_TTL: Duration = Duration::from_secs(60);

/// How often the background pruner sweeps both tiers.
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);

type PendingRx = watch::Receiver<Option<AckRecord>>;
type PendingTx = watch::Sender<Option<AckRecord>>;

struct CachedAck {
    record: AckRecord,
    stored_at: Instant,
}

struct CachedSig {
    source_message_id: String,
    record: AckRecord,
    stored_at: Instant,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, CachedAck>,
    by_sig: HashMap<String, CachedSig>,
    pending_by_id: HashMap<String, PendingRx>,
    pending_by_sig: HashMap<String, (String, PendingRx)>,
}

/// Outcome of consulting the cache for an ack-eligible frame.
pub enum Decision {
    /// Already dispatched (or in flight and now resolved): reply with
    /// this record, do not dispatch again.
    Replay(AckRecord),
    /// First sighting: dispatch, then resolve the guard.
    Fresh(PendingGuard),
}

/// Resolution state for `delivery-check` frames.
pub enum DeliveryState {
    Known(AckRecord),
    Pending,
    Unknown,
}

/// The ACK & dedup cache. The dispatcher is its only writer.
pub struct AckCache {
    sig_ttl: Duration,
    inner: Mutex<Inner>,
}

impl AckCache {
    pub fn new(sig_ttl: Duration) -> Self {
        Self { sig_ttl, inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consult both tiers for `message_id`/`signature`, in strict order:
    /// id cache, id pending, signature cache, signature pending, miss.
    /// Awaiting a pending entry never holds the cache lock.
    pub async fn begin(
        self: &Arc<Self>,
        message_id: &str,
        signature: &str,
    ) -> Decision {
        let (rx, mode, source_message_id) = {
            let mut inner = self.lock();
            prune(&mut inner, self.sig_ttl);

            let id_hit = inner.by_id.get(message_id).map(|c| c.record.clone());
            if let Some(mut record) = id_hit {
                metrics::counter!("comms.dedupe.hit", "mode" => "cache").increment(1);
                record.dedupe =
                    Some(DedupeInfo { mode: DedupeMode::Cache, source_message_id: None });
                return Decision::Replay(record);
            }

            let id_pending = inner.pending_by_id.get(message_id).cloned();
            if let Some(rx) = id_pending {
                metrics::counter!("comms.dedupe.hit", "mode" => "cache").increment(1);
                (rx, DedupeMode::Cache, None)
            } else {
                let sig_hit = inner
                    .by_sig
                    .get(signature)
                    .map(|c| (c.source_message_id.clone(), c.record.clone()));
                if let Some((source, record)) = sig_hit {
                    metrics::counter!("comms.dedupe.hit", "mode" => "signature_cache")
                        .increment(1);
                    // The retried messageId now resolves directly too.
                    inner.by_id.insert(
                        message_id.to_owned(),
                        CachedAck { record: record.clone(), stored_at: Instant::now() },
                    );
                    let mut replay = record;
                    replay.dedupe = Some(DedupeInfo {
                        mode: DedupeMode::SignatureCache,
                        source_message_id: Some(source),
                    });
                    return Decision::Replay(replay);
                }

                let sig_pending =
                    inner.pending_by_sig.get(signature).map(|(s, rx)| (s.clone(), rx.clone()));
                if let Some((source, rx)) = sig_pending {
                    metrics::counter!("comms.dedupe.hit", "mode" => "signature_pending")
                        .increment(1);
                    (rx, DedupeMode::SignaturePending, Some(source))
                } else {
                    let (tx_id, rx_id) = watch::channel(None);
                    let (tx_sig, rx_sig) = watch::channel(None);
                    inner.pending_by_id.insert(message_id.to_owned(), rx_id);
                    inner
                        .pending_by_sig
                        .insert(signature.to_owned(), (message_id.to_owned(), rx_sig));
                    return Decision::Fresh(PendingGuard {
                        cache: Arc::clone(self),
                        message_id: message_id.to_owned(),
                        signature: signature.to_owned(),
                        tx_id,
                        tx_sig,
                        done: false,
                    });
                }
            }
        };

        // Await the in-flight dispatch outside the lock.
        let mut record = await_pending(rx).await.unwrap_or_else(abandoned_ack);
        record.dedupe = Some(DedupeInfo { mode, source_message_id });
        if mode == DedupeMode::SignaturePending && record.status != "handler_error" {
            // Key the retried messageId to the resolved record as well.
            self.lock().by_id.insert(
                message_id.to_owned(),
                CachedAck { record: strip(&record), stored_at: Instant::now() },
            );
        }
        Decision::Replay(record)
    }

    /// Resolution state for `delivery-check`.
    pub fn delivery_state(&self, message_id: &str) -> DeliveryState {
        let mut inner = self.lock();
        prune(&mut inner, self.sig_ttl);
        if let Some(cached) = inner.by_id.get(message_id) {
            return DeliveryState::Known(cached.record.clone());
        }
        if inner.pending_by_id.contains_key(message_id) {
            return DeliveryState::Pending;
        }
        DeliveryState::Unknown
    }

    /// Background sweep of expired entries.
    pub async fn run_pruner(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
                _ = shutdown.cancelled() => {
                    debug!("ack cache pruner shutting down");
                    return;
                }
            }
            let mut inner = self.lock();
            prune(&mut inner, self.sig_ttl);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_by_id(&self, message_id: &str) -> Option<AckRecord> {
        self.lock().by_id.get(message_id).map(|c| c.record.clone())
    }
}

/// In-flight dispatch handle. Installed before dispatch; must be resolved
/// exactly once. Dropping an unresolved guard fails all waiters so a
/// cancelled dispatch never orphans a retry.
pub struct PendingGuard {
    cache: Arc<AckCache>,
    message_id: String,
    signature: String,
    tx_id: PendingTx,
    tx_sig: PendingTx,
    done: bool,
}

impl PendingGuard {
    /// Resolve both pending futures and (unless the dispatch failed in a
    /// retryable way) cache the record in both tiers.
    pub fn resolve(mut self, record: &AckRecord, cache_result: bool) {
        self.done = true;
        let clean = strip(record);
        {
            let mut inner = self.cache.lock();
            inner.pending_by_id.remove(&self.message_id);
            inner.pending_by_sig.remove(&self.signature);
            if cache_result {
                inner.by_id.insert(
                    self.message_id.clone(),
                    CachedAck { record: clean.clone(), stored_at: Instant::now() },
                );
                inner.by_sig.insert(
                    self.signature.clone(),
                    CachedSig {
                        source_message_id: self.message_id.clone(),
                        record: clean.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }
        }
        self.tx_id.send_replace(Some(clean.clone()));
        self.tx_sig.send_replace(Some(clean));
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut inner = self.cache.lock();
        inner.pending_by_id.remove(&self.message_id);
        inner.pending_by_sig.remove(&self.signature);
        drop(inner);
        let record = abandoned_ack();
        self.tx_id.send_replace(Some(record.clone()));
        self.tx_sig.send_replace(Some(record));
    }
}

/// Remove per-occurrence dedup provenance before caching.
fn strip(record: &AckRecord) -> AckRecord {
    let mut clean = record.clone();
    clean.dedupe = None;
    clean
}

fn abandoned_ack() -> AckRecord {
    AckRecord {
        ok: false,
        accepted: false,
        queued: false,
        verified: false,
        status: "handler_error".into(),
        ws_delivery_count: 0,
        ack_latency_ms: 0,
        error: Some("dispatch abandoned before resolution".into()),
        dedupe: None,
        handler_result: None,
    }
}

async fn await_pending(mut rx: PendingRx) -> Option<AckRecord> {
    loop {
        let current = rx.borrow().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

fn prune(inner: &mut Inner, sig_ttl: Duration) {
    inner.by_id.retain(|_, c| c.stored_at.elapsed() <= ID_TTL);
    inner.by_sig.retain(|_, c| c.stored_at.elapsed() <= sig_ttl);
}

/// Stable content signature over everything that identifies a delivery
/// except the messageId itself.
pub fn content_signature(
    frame_type: &str,
    sender_role: Option<&str>,
    sender_pane: Option<&str>,
    target: &str,
    priority: &str,
    content: &str,
) -> String {
    use sha1::{Digest, Sha1};
    let preimage = format!(
        "t:{}|r:{}|p:{}|g:{}|q:{}|c:{}",
        frame_type,
        sender_role.unwrap_or(""),
        sender_pane.unwrap_or(""),
        target.trim().to_lowercase(),
        priority,
        content,
    );
    Sha1::digest(preimage.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;
