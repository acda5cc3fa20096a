// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::bridge::{BridgeConfig, DEFAULT_ACK_TIMEOUT_MS};
use crate::supervisor::CoreConfig;

/// Multi-agent coordination bus for a developer workstation.
#[derive(Debug, Clone, Parser)]
#[command(name = "switchboard", version, about)]
pub struct Config {
    /// Loopback port for the WebSocket hub (0 = ephemeral).
    #[arg(long, env = "SWITCHBOARD_PORT", default_value = "4390")]
    pub port: u16,

    /// Coordination workspace root (state lives under it).
    #[arg(long, env = "SWITCHBOARD_COORD_ROOT", default_value = ".switchboard")]
    pub coord_root: PathBuf,

    /// Queue file override; defaults to <coord-root>/state/comms-outbound-queue.json.
    #[arg(long, env = "SWITCHBOARD_QUEUE_PATH")]
    pub queue_path: Option<PathBuf>,

    /// Offline queue capacity (oldest entries evicted beyond this).
    #[arg(long, env = "SWITCHBOARD_QUEUE_MAX_ENTRIES", default_value = "500")]
    pub queue_max_entries: usize,

    /// Discard queued entries older than this.
    #[arg(long, env = "SWITCHBOARD_QUEUE_MAX_AGE_MS", default_value = "1800000")]
    pub queue_max_age_ms: u64,

    /// Timer-driven queue retry interval.
    #[arg(long, env = "SWITCHBOARD_QUEUE_FLUSH_INTERVAL_MS", default_value = "30000")]
    pub queue_flush_interval_ms: u64,

    /// TTL of the content-signature dedup tier.
    #[arg(long, env = "SWITCHBOARD_DEDUP_SIGNATURE_TTL_MS", default_value = "15000")]
    pub dedup_signature_ttl_ms: u64,

    /// Relay endpoint for cross-device bridging (unset = bridge disabled).
    #[arg(long, env = "SWITCHBOARD_BRIDGE_URL")]
    pub bridge_url: Option<String>,

    /// This device's identity with the relay.
    #[arg(long, env = "SWITCHBOARD_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Pre-shared relay secret.
    #[arg(long, env = "SWITCHBOARD_BRIDGE_SECRET")]
    pub bridge_secret: Option<String>,

    /// Bridge reconnect backoff base.
    #[arg(long, env = "SWITCHBOARD_BRIDGE_RECONNECT_BASE_MS", default_value = "750")]
    pub bridge_reconnect_base_ms: u64,

    /// Bridge reconnect backoff cap.
    #[arg(long, env = "SWITCHBOARD_BRIDGE_RECONNECT_MAX_MS", default_value = "10000")]
    pub bridge_reconnect_max_ms: u64,

    /// Force the hub into this process instead of a worker child.
    #[arg(long, env = "SWITCHBOARD_IN_PROCESS")]
    pub in_process: bool,

    /// Session scope; queued entries from other scopes are discarded.
    /// Defaults to a fresh scope per boot.
    #[arg(long, env = "SWITCHBOARD_SESSION_SCOPE")]
    pub session_scope: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "SWITCHBOARD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        if self.queue_max_entries == 0 {
            anyhow::bail!("--queue-max-entries must be at least 1");
        }
        if self.bridge_url.is_none() && self.bridge_secret.is_some() {
            anyhow::bail!("--bridge-secret requires --bridge-url");
        }
        Ok(())
    }

    /// Resolve the session scope once per boot.
    pub fn resolved_session_scope(&self) -> String {
        self.session_scope
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("scope-{}", uuid::Uuid::new_v4()))
    }

    /// The durable queue file path.
    pub fn resolved_queue_path(&self) -> PathBuf {
        self.queue_path
            .clone()
            .unwrap_or_else(|| self.coord_root.join("state").join("comms-outbound-queue.json"))
    }

    /// This device's relay identity: flag, then hostname, then "local".
    pub fn resolved_device_id(&self) -> String {
        self.device_id
            .clone()
            .filter(|d| !d.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "local".to_owned())
    }

    /// Bridge settings, when a relay is configured.
    pub fn bridge(&self) -> Option<BridgeConfig> {
        self.bridge_url.as_ref().map(|url| BridgeConfig {
            url: url.clone(),
            device_id: self.resolved_device_id(),
            shared_secret: self.bridge_secret.clone(),
            reconnect_base: Duration::from_millis(self.bridge_reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.bridge_reconnect_max_ms),
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
        })
    }

    /// Assemble the core configuration for the supervisor.
    pub fn core(&self, session_scope: &str) -> CoreConfig {
        CoreConfig {
            port: self.port,
            session_scope: session_scope.to_owned(),
            queue_path: Some(self.resolved_queue_path()),
            queue_max_entries: self.queue_max_entries,
            queue_max_age: Duration::from_millis(self.queue_max_age_ms),
            queue_flush_interval: Duration::from_millis(self.queue_flush_interval_ms),
            dedup_signature_ttl: Duration::from_millis(self.dedup_signature_ttl_ms),
            bridge: self.bridge(),
            worker: !self.in_process,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
