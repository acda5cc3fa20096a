// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection registry: maps live connections to `(role, paneId)` and
//! answers "is anyone listening for target X".
//!
//! Targets arriving from upstream may be a role name, a role alias, or a
//! pane ID. Both halves are resolved to canonical values once, here, so
//! downstream components only ever match on canonical role/pane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::proto::ServerFrame;
use crate::trace::now_ms;

/// Default staleness threshold for route health checks.
pub const DEFAULT_STALE_AFTER_MS: u64 = 60_000;

/// Canonical agent roles. Legacy aliases live in [`Role::from_alias`];
/// adding a role is a one-line change there and in the pane map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Architect,
    Builder,
    Oracle,
}

impl Role {
    /// Normalize a raw role string through the alias table.
    /// Unknown roles map to `None`.
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "architect" | "lead" => Some(Self::Architect),
            "builder" | "backend" | "infra" | "orchestrator" => Some(Self::Builder),
            "oracle" | "analyst" | "investigator" => Some(Self::Oracle),
            _ => None,
        }
    }

    /// The pane a role occupies when the caller did not name one.
    pub fn canonical_pane(&self) -> &'static str {
        match self {
            Self::Architect => "1",
            Self::Builder => "2",
            Self::Oracle => "3",
        }
    }

    /// Reverse of [`Role::canonical_pane`].
    pub fn from_pane(pane: &str) -> Option<Self> {
        match pane.trim() {
            "1" => Some(Self::Architect),
            "2" => Some(Self::Builder),
            "3" => Some(Self::Oracle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Builder => "builder",
            Self::Oracle => "oracle",
        }
    }
}

/// What refreshed a client's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchSource {
    Message,
    Register,
    HealthCheck,
}

impl TouchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Register => "register",
            Self::HealthCheck => "health-check",
        }
    }
}

/// A connected client. Cloned snapshots are handed to the dispatcher;
/// the registry remains the only writer.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub conn_id: u64,
    pub tx: mpsc::UnboundedSender<ServerFrame>,
    pub role: Option<Role>,
    pub pane_id: Option<String>,
    pub connected_at_ms: u64,
    pub last_seen_ms: u64,
}

/// Route health snapshot for `health-check` frames.
#[derive(Debug, Clone)]
pub struct RouteHealth {
    pub healthy: bool,
    pub status: &'static str,
    pub last_seen: Option<u64>,
    pub age_ms: Option<u64>,
    pub role: Option<String>,
    pub pane_id: Option<String>,
}

/// Connection registry — the only authority for target resolution.
#[derive(Default)]
pub struct Registry {
    clients: RwLock<HashMap<u64, ClientEntry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self { clients: RwLock::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Admit a new connection. Role and pane stay unset until `register`.
    pub async fn add(&self, tx: mpsc::UnboundedSender<ServerFrame>) -> u64 {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = now_ms();
        self.clients.write().await.insert(
            conn_id,
            ClientEntry {
                conn_id,
                tx,
                role: None,
                pane_id: None,
                connected_at_ms: now,
                last_seen_ms: now,
            },
        );
        conn_id
    }

    /// Set role/pane for a connection, normalizing both halves. If only
    /// one is provided the other is filled from the canonical map.
    /// Never fails: unknown roles and panes are stored as `None`.
    pub async fn register(
        &self,
        conn_id: u64,
        role: Option<&str>,
        pane_id: Option<&str>,
    ) -> (Option<Role>, Option<String>) {
        let mut role = role.and_then(Role::from_alias);
        let mut pane = crate::proto::clean_ident(pane_id);

        match (role, pane.as_deref()) {
            (None, Some(p)) => role = Role::from_pane(p),
            (Some(r), None) => pane = Some(r.canonical_pane().to_owned()),
            _ => {}
        }

        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(&conn_id) {
            entry.role = role;
            entry.pane_id = pane.clone();
            entry.last_seen_ms = now_ms();
            debug!(
                conn_id,
                role = role.map(|r| r.as_str()),
                pane = pane.as_deref(),
                "client registered"
            );
        }
        (role, pane)
    }

    /// Refresh a connection's liveness.
    pub async fn touch(&self, conn_id: u64, source: TouchSource) {
        if let Some(entry) = self.clients.write().await.get_mut(&conn_id) {
            entry.last_seen_ms = now_ms();
            debug!(conn_id, source = source.as_str(), "liveness touch");
        }
    }

    /// Resolve a target (role, alias, or pane ID; case-insensitive) to
    /// every matching client. A role shared across sessions matches all
    /// of them.
    pub async fn lookup(&self, target: &str) -> Vec<ClientEntry> {
        let target = target.trim();
        if target.is_empty() {
            return vec![];
        }
        let as_role = Role::from_alias(target);
        self.clients
            .read()
            .await
            .values()
            .filter(|c| {
                (as_role.is_some() && c.role == as_role)
                    || c.pane_id.as_deref().is_some_and(|p| p.eq_ignore_ascii_case(target))
            })
            .cloned()
            .collect()
    }

    /// Every connected client except `conn_id` (broadcast fan-out set).
    pub async fn all_except(&self, conn_id: u64) -> Vec<ClientEntry> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.conn_id != conn_id)
            .cloned()
            .collect()
    }

    /// Snapshot of a single connection.
    pub async fn get(&self, conn_id: u64) -> Option<ClientEntry> {
        self.clients.read().await.get(&conn_id).cloned()
    }

    /// Snapshot of every connected client.
    pub async fn all(&self) -> Vec<ClientEntry> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Route health for a target: `healthy` iff the freshest matching
    /// client was seen within `stale_after_ms`.
    pub async fn route_health(&self, target: &str, stale_after_ms: u64) -> RouteHealth {
        let target = target.trim();
        if target.is_empty() {
            return RouteHealth {
                healthy: false,
                status: "invalid_target",
                last_seen: None,
                age_ms: None,
                role: None,
                pane_id: None,
            };
        }

        let matches = self.lookup(target).await;
        let Some(freshest) = matches.iter().max_by_key(|c| c.last_seen_ms) else {
            return RouteHealth {
                healthy: false,
                status: "no_route",
                last_seen: None,
                age_ms: None,
                role: None,
                pane_id: None,
            };
        };

        let age_ms = now_ms().saturating_sub(freshest.last_seen_ms);
        let healthy = age_ms <= stale_after_ms;
        RouteHealth {
            healthy,
            status: if healthy { "healthy" } else { "stale" },
            last_seen: Some(freshest.last_seen_ms),
            age_ms: Some(age_ms),
            role: freshest.role.map(|r| r.as_str().to_owned()),
            pane_id: freshest.pane_id.clone(),
        }
    }

    /// Remove a closed connection.
    pub async fn close(&self, conn_id: u64) {
        if self.clients.write().await.remove(&conn_id).is_some() {
            debug!(conn_id, "client closed");
        }
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
