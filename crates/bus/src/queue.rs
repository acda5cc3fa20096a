// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable offline queue for undeliverable targeted messages.
//!
//! Entries are scoped to one process lifetime: the queue file carries a
//! `sessionScopeId`, and entries written under another scope are
//! discarded on load. A restart is a clean slate by design — do not
//! "improve" this by accepting prior scopes' entries.
//!
//! The file is rewritten whole (temp-file + rename) on every mutation so
//! a crash mid-write never leaves a torn queue behind.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proto::Priority;
use crate::registry::Role;
use crate::trace::{new_queue_id, now_ms, TraceContext};

pub const DEFAULT_MAX_ENTRIES: usize = 500;
pub const DEFAULT_MAX_AGE_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30_000;

const FILE_VERSION: u32 = 2;

/// Delivery metadata carried alongside a queued message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One parked message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    pub target: String,
    pub content: String,
    pub meta: EntryMeta,
    pub created_at: u64,
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    pub session_scope_id: String,
    pub queued_by: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueFile {
    version: u32,
    session_scope_id: String,
    entries: Vec<QueueEntry>,
}

/// Durable FIFO of undeliverable targeted messages. The queue is the
/// only writer of its file.
pub struct OutboundQueue {
    path: Option<PathBuf>,
    scope: String,
    max_entries: usize,
    max_age: Duration,
    entries: Mutex<VecDeque<QueueEntry>>,
    /// Timer-driven and registration-driven flushes are mutually
    /// excluded; a second flush observing the flag is a no-op.
    flush_in_flight: AtomicBool,
    /// Cleared on the first disk failure; the in-memory queue stays live.
    persistence_ok: AtomicBool,
}

impl OutboundQueue {
    /// Create a queue. `path = None` (tests) keeps everything in memory.
    pub fn new(path: Option<PathBuf>, scope: &str, max_entries: usize, max_age: Duration) -> Self {
        Self {
            path,
            scope: scope.to_owned(),
            max_entries,
            max_age,
            entries: Mutex::new(VecDeque::new()),
            flush_in_flight: AtomicBool::new(false),
            persistence_ok: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restore entries from disk, discarding legacy formats, foreign
    /// scopes, and stale entries. Rewrites the file when anything was
    /// dropped so stale traffic cannot resurface on the next boot.
    pub fn load_from_disk(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let Ok(contents) = std::fs::read_to_string(path) else {
            return;
        };

        let parsed: Result<serde_json::Value, _> = serde_json::from_str(&contents);
        let Ok(value) = parsed else {
            warn!(path = %path.display(), "queue file unreadable, starting empty");
            self.persist();
            return;
        };

        if value.is_array() {
            info!(path = %path.display(), "discarding legacy bare-array queue file");
            self.persist();
            return;
        }

        let file: QueueFile = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "queue file malformed, starting empty");
                self.persist();
                return;
            }
        };

        if file.version != FILE_VERSION || file.session_scope_id != self.scope {
            info!(
                path = %path.display(),
                file_scope = %file.session_scope_id,
                live_scope = %self.scope,
                "discarding queue entries from another session scope"
            );
            self.persist();
            return;
        }

        let now = now_ms();
        let max_age_ms = self.max_age.as_millis() as u64;
        let total = file.entries.len();
        let mut kept: VecDeque<QueueEntry> = file
            .entries
            .into_iter()
            .filter(|e| e.session_scope_id == self.scope)
            .filter(|e| now.saturating_sub(e.created_at) <= max_age_ms)
            .collect();
        while kept.len() > self.max_entries {
            kept.pop_front();
        }
        let dropped = total - kept.len();

        info!(restored = kept.len(), dropped, "outbound queue restored from disk");
        *self.lock() = kept;
        if dropped > 0 {
            self.persist();
        }
        self.record_depth();
    }

    /// Park an undeliverable message. Prunes by age, evicts the oldest
    /// entry at capacity, persists.
    pub fn enqueue(
        &self,
        target: &str,
        content: &str,
        meta: EntryMeta,
        queued_by: &str,
    ) -> String {
        let id = new_queue_id();
        {
            let mut entries = self.lock();
            prune_stale(&mut entries, self.max_age);
            while entries.len() >= self.max_entries {
                if let Some(evicted) = entries.pop_front() {
                    warn!(id = %evicted.id, target = %evicted.target, "queue full, evicting oldest entry");
                }
            }
            entries.push_back(QueueEntry {
                id: id.clone(),
                target: target.trim().to_owned(),
                content: content.to_owned(),
                meta,
                created_at: now_ms(),
                attempts: 0,
                last_attempt_at: None,
                session_scope_id: self.scope.clone(),
                queued_by: queued_by.to_owned(),
            });
            debug!(id = %id, target = %target, queued_by, depth = entries.len(), "message queued");
        }
        self.persist();
        self.record_depth();
        id
    }

    /// Replay entries addressed to a newly registered client. `deliver`
    /// returns whether the replay reached the client; delivered entries
    /// are removed, failures keep the entry with `attempts` incremented.
    pub fn flush_for_client(
        &self,
        role: Option<Role>,
        pane_id: Option<&str>,
        source: &str,
        mut deliver: impl FnMut(&QueueEntry) -> bool,
    ) -> usize {
        self.flush_where(source, |entry| entry_matches(&entry.target, role, pane_id), &mut deliver)
    }

    /// Periodic retry across the whole queue; `deliver` decides per entry
    /// whether the target has become reachable.
    pub fn flush_all(&self, source: &str, mut deliver: impl FnMut(&QueueEntry) -> bool) -> usize {
        self.flush_where(source, |_| true, &mut deliver)
    }

    fn flush_where(
        &self,
        source: &str,
        matches: impl Fn(&QueueEntry) -> bool,
        deliver: &mut dyn FnMut(&QueueEntry) -> bool,
    ) -> usize {
        if self
            .flush_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(source, "queue flush already in flight, skipping");
            return 0;
        }

        let mut delivered = 0usize;
        let mut mutated = false;
        {
            let mut entries = self.lock();
            let before = entries.len();
            prune_stale(&mut entries, self.max_age);
            mutated |= entries.len() != before;

            let mut remaining = VecDeque::with_capacity(entries.len());
            while let Some(mut entry) = entries.pop_front() {
                if !matches(&entry) {
                    remaining.push_back(entry);
                    continue;
                }
                if deliver(&entry) {
                    delivered += 1;
                    mutated = true;
                } else {
                    entry.attempts += 1;
                    entry.last_attempt_at = Some(now_ms());
                    mutated = true;
                    remaining.push_back(entry);
                }
            }
            *entries = remaining;
        }
        self.flush_in_flight.store(false, Ordering::Release);

        if mutated {
            self.persist();
            self.record_depth();
        }
        if delivered > 0 {
            info!(source, delivered, "flushed queued messages");
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot for delivery-check / diagnostics.
    pub fn contains_message_for(&self, target: &str) -> bool {
        self.lock().iter().any(|e| e.target.eq_ignore_ascii_case(target.trim()))
    }

    /// Rewrite the queue file atomically. Failure disables persistence
    /// for the rest of this process; the in-memory queue stays live.
    fn persist(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        if !self.persistence_ok.load(Ordering::Acquire) {
            return;
        }

        let file = QueueFile {
            version: FILE_VERSION,
            session_scope_id: self.scope.clone(),
            entries: self.lock().iter().cloned().collect(),
        };
        let Ok(json) = serde_json::to_string_pretty(&file) else {
            return;
        };

        let parent = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let result = std::fs::create_dir_all(&parent)
            .map_err(anyhow::Error::from)
            .and_then(|()| tempfile::NamedTempFile::new_in(&parent).map_err(Into::into))
            .and_then(|mut tmp| {
                tmp.write_all(json.as_bytes())?;
                tmp.persist(path)?;
                Ok(())
            });

        if let Err(e) = result {
            warn!(path = %path.display(), err = %e, "queue persistence failed, continuing in memory only");
            self.persistence_ok.store(false, Ordering::Release);
        }
    }

    fn record_depth(&self) {
        metrics::gauge!("comms.queue.depth").set(self.len() as f64);
    }
}

/// Whether a queued target addresses the given client.
pub fn entry_matches(target: &str, role: Option<Role>, pane_id: Option<&str>) -> bool {
    let target = target.trim();
    if target.is_empty() {
        return false;
    }
    (role.is_some() && Role::from_alias(target) == role)
        || pane_id.is_some_and(|p| p.eq_ignore_ascii_case(target))
}

fn prune_stale(entries: &mut VecDeque<QueueEntry>, max_age: Duration) {
    let now = now_ms();
    let max_age_ms = max_age.as_millis() as u64;
    entries.retain(|e| now.saturating_sub(e.created_at) <= max_age_ms);
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
