// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridge round-trips against a fake relay.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::json;

use switchboard::bridge::{
    BridgeClient, BridgeConfig, BridgeState, InboundHandler, SendRequest,
};
use switchboard::handler::HandlerVerdict;
use switchboard::supervisor::{CoreConfig, Supervisor};
use switchboard_specs::{FakeRelay, RelayOptions, TestBus, TIMEOUT};

fn bridge_config(url: String) -> BridgeConfig {
    BridgeConfig {
        url,
        device_id: "desk-l".to_owned(),
        shared_secret: Some("relay-secret".to_owned()),
        reconnect_base: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(500),
        ack_timeout: Duration::from_millis(2_000),
    }
}

fn accepting_inbound() -> InboundHandler {
    Arc::new(|_delivery| {
        Box::pin(async move { Ok(HandlerVerdict { ok: Some(true), ..Default::default() }) })
    })
}

async fn wait_registered(client: &BridgeClient) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while client.state() != BridgeState::Registered {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("bridge never registered");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

#[tokio::test]
async fn send_round_trip_resolves_on_xack() -> anyhow::Result<()> {
    let relay = FakeRelay::start(RelayOptions::default()).await?;
    let client = BridgeClient::start(bridge_config(relay.url()), accepting_inbound());
    wait_registered(&client).await?;

    let result = client
        .send_to_device(SendRequest {
            message_id: Some("b1".into()),
            to_device: "peer".into(),
            content: "hello".into(),
            from_role: Some("architect".into()),
            target_role: Some("architect".into()),
            timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        })
        .await;

    assert!(result.ok);
    assert!(result.verified);
    assert_eq!(result.status, "bridge_delivered");
    assert_eq!(result.from_device, "DESK-L");
    assert_eq!(result.to_device, "PEER");

    let xsend = relay.wait_for_frame("xsend").await?;
    assert_eq!(xsend["messageId"], "b1");
    assert_eq!(xsend["toDevice"], "PEER");
    assert_eq!(xsend["fromRole"], "architect");

    let register = relay.wait_for_frame("register").await?;
    assert_eq!(register["deviceId"], "DESK-L");
    assert_eq!(register["sharedSecret"], "relay-secret");

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn silent_relay_times_out_the_send() -> anyhow::Result<()> {
    let relay =
        FakeRelay::start(RelayOptions { answer_sends: false, ..Default::default() }).await?;
    let client = BridgeClient::start(bridge_config(relay.url()), accepting_inbound());
    wait_registered(&client).await?;

    let started = tokio::time::Instant::now();
    let result = client
        .send_to_device(SendRequest {
            message_id: Some("b1".into()),
            to_device: "peer".into(),
            content: "hello".into(),
            timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        })
        .await;

    assert!(!result.ok);
    assert_eq!(result.status, "bridge_ack_timeout");
    assert!(started.elapsed() >= Duration::from_millis(200));

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn outbound_payloads_are_redacted() -> anyhow::Result<()> {
    let relay = FakeRelay::start(RelayOptions::default()).await?;
    let client = BridgeClient::start(bridge_config(relay.url()), accepting_inbound());
    wait_registered(&client).await?;

    client
        .send_to_device(SendRequest {
            message_id: Some("b2".into()),
            to_device: "peer".into(),
            content: "OPENAI_API_KEY=sk-abcdef1234567890abcdef".into(),
            metadata: Some(json!({
                "apiKey": "super-secret",
                "structured": { "type": "WeirdType", "payload": { "detail": "rotating keys" } },
            })),
            timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        })
        .await;

    let xsend = relay.wait_for_frame("xsend").await?;
    let wire = serde_json::to_string(&xsend)?;
    assert!(!wire.contains("sk-abcdef1234567890abcdef"));
    assert!(!wire.contains("super-secret"));
    assert_eq!(xsend["content"], "OPENAI_API_KEY=[REDACTED]");
    assert_eq!(xsend["metadata"]["apiKey"], "[REDACTED]");
    // Unknown structured types are downgraded before leaving the device.
    assert_eq!(xsend["metadata"]["structured"]["type"], "FYI");
    assert_eq!(xsend["metadata"]["structured"]["payload"]["originalType"], "WeirdType");

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn discovery_lists_devices_sorted() -> anyhow::Result<()> {
    let relay = FakeRelay::start(RelayOptions::default()).await?;
    let client = BridgeClient::start(bridge_config(relay.url()), accepting_inbound());
    wait_registered(&client).await?;

    let result = client.discover_devices(Some(Duration::from_millis(500))).await;
    assert!(result.ok);
    let ids: Vec<&str> = result.devices.iter().map(|d| d.device_id.as_str()).collect();
    assert_eq!(ids, vec!["ALPHA", "ZULU"]);

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn discovery_unsupported_is_reported() -> anyhow::Result<()> {
    let relay =
        FakeRelay::start(RelayOptions { discovery_unsupported: true, ..Default::default() })
            .await?;
    let client = BridgeClient::start(bridge_config(relay.url()), accepting_inbound());
    wait_registered(&client).await?;

    let result = client.discover_devices(Some(Duration::from_millis(500))).await;
    assert!(!result.ok);
    assert_eq!(result.status.as_deref(), Some("bridge_discovery_unsupported"));

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn inbound_delivery_is_acked_with_the_host_verdict() -> anyhow::Result<()> {
    let relay = FakeRelay::start(RelayOptions::default()).await?;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    let inbound: InboundHandler = Arc::new(move |delivery| {
        seen_in_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delivery.content.clone());
        Box::pin(async move {
            Ok(HandlerVerdict {
                ok: Some(true),
                status: Some("delivered.verified".to_owned()),
                ..Default::default()
            })
        })
    });
    let client = BridgeClient::start(bridge_config(relay.url()), inbound);
    wait_registered(&client).await?;

    relay
        .push(&json!({
            "type": "xdeliver",
            "messageId": "d1",
            "fromDevice": "PEER",
            "fromRole": "architect",
            "targetRole": "architect",
            "content": "peer says hi",
        }))
        .await?;

    let xack = relay.wait_for_frame("xack").await?;
    assert_eq!(xack["messageId"], "d1");
    assert_eq!(xack["ok"], true);
    assert_eq!(xack["status"], "delivered.verified");
    assert_eq!(seen.lock().unwrap_or_else(PoisonError::into_inner).as_slice(), ["peer says hi"]);

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn inbound_handler_error_becomes_bridge_handler_error() -> anyhow::Result<()> {
    let relay = FakeRelay::start(RelayOptions::default()).await?;
    let inbound: InboundHandler =
        Arc::new(|_delivery| Box::pin(async move { anyhow::bail!("host exploded") }));
    let client = BridgeClient::start(bridge_config(relay.url()), inbound);
    wait_registered(&client).await?;

    relay
        .push(&json!({ "type": "xdeliver", "messageId": "d2", "content": "boom" }))
        .await?;

    let xack = relay.wait_for_frame("xack").await?;
    assert_eq!(xack["ok"], false);
    assert_eq!(xack["status"], "bridge_handler_error");
    assert_eq!(xack["error"], "host exploded");

    client.stop();
    relay.stop();
    Ok(())
}

#[tokio::test]
async fn xdeliver_reaches_the_local_architect_pane() -> anyhow::Result<()> {
    let relay = FakeRelay::start(RelayOptions::default()).await?;

    // A full core with the bridge wired to the local dispatcher.
    let supervisor = Supervisor::new();
    let addr = supervisor
        .start(
            CoreConfig {
                port: 0,
                session_scope: "scope-x".to_owned(),
                queue_path: None,
                queue_max_entries: 500,
                queue_max_age: Duration::from_secs(1800),
                queue_flush_interval: Duration::from_secs(30),
                dedup_signature_ttl: Duration::from_secs(15),
                bridge: Some(bridge_config(relay.url())),
                worker: false,
            },
            None,
        )
        .await?;
    let bus = TestBus { supervisor, addr, scratch: None };

    let mut architect = bus.connect().await?;
    architect.register("architect").await?;

    // Give the bridge a moment to register with the relay.
    relay.wait_for_frame("register").await?;
    relay
        .push(&json!({
            "type": "xdeliver",
            "messageId": "d3",
            "fromDevice": "PEER",
            "fromRole": "architect",
            "targetRole": "architect",
            "content": "cross-device hello",
        }))
        .await?;

    let message = architect.recv_type("message").await?;
    assert_eq!(message["content"], "cross-device hello");
    assert_eq!(message["metadata"]["fromDevice"], "PEER");
    assert_eq!(message["metadata"]["structured"]["type"], "FYI");

    let xack = relay.wait_for_frame("xack").await?;
    assert_eq!(xack["messageId"], "d3");
    assert_eq!(xack["ok"], true);
    assert_eq!(xack["status"], "delivered.websocket");

    bus.stop().await;
    relay.stop();
    Ok(())
}
