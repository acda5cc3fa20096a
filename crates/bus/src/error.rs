// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery status codes carried on `send-ack` frames and bridge results.
///
/// Handlers may supply free-form status strings; these are the codes the
/// core itself mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    #[serde(rename = "delivered.verified")]
    DeliveredVerified,
    #[serde(rename = "delivered.websocket")]
    DeliveredWebsocket,
    #[serde(rename = "accepted.unverified")]
    AcceptedUnverified,
    #[serde(rename = "unrouted")]
    Unrouted,
    #[serde(rename = "handler_error")]
    HandlerError,
    #[serde(rename = "invalid_target")]
    InvalidTarget,
    #[serde(rename = "bridge_delivered")]
    BridgeDelivered,
    #[serde(rename = "bridge_ack_timeout")]
    BridgeAckTimeout,
    #[serde(rename = "bridge_unavailable")]
    BridgeUnavailable,
    #[serde(rename = "bridge_send_failed")]
    BridgeSendFailed,
    #[serde(rename = "bridge_handler_error")]
    BridgeHandlerError,
    #[serde(rename = "bridge_discovery_unsupported")]
    BridgeDiscoveryUnsupported,
    #[serde(rename = "bridge_stopped")]
    BridgeStopped,
    #[serde(rename = "target_offline")]
    TargetOffline,
    #[serde(rename = "rate_limited")]
    RateLimited,
    #[serde(rename = "oversize")]
    Oversize,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeliveredVerified => "delivered.verified",
            Self::DeliveredWebsocket => "delivered.websocket",
            Self::AcceptedUnverified => "accepted.unverified",
            Self::Unrouted => "unrouted",
            Self::HandlerError => "handler_error",
            Self::InvalidTarget => "invalid_target",
            Self::BridgeDelivered => "bridge_delivered",
            Self::BridgeAckTimeout => "bridge_ack_timeout",
            Self::BridgeUnavailable => "bridge_unavailable",
            Self::BridgeSendFailed => "bridge_send_failed",
            Self::BridgeHandlerError => "bridge_handler_error",
            Self::BridgeDiscoveryUnsupported => "bridge_discovery_unsupported",
            Self::BridgeStopped => "bridge_stopped",
            Self::TargetOffline => "target_offline",
            Self::RateLimited => "rate_limited",
            Self::Oversize => "oversize",
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
