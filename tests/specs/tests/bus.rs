// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end bus scenarios over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use switchboard::handler::MessageHandler;
use switchboard_specs::{TestBus, WsClient};

fn send_frame(target: &str, content: &str, message_id: &str) -> serde_json::Value {
    json!({
        "type": "send",
        "target": target,
        "content": content,
        "messageId": message_id,
        "ackRequired": true,
    })
}

#[tokio::test]
async fn welcome_on_connect() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-w", None).await?;
    let mut client = bus.connect().await?;
    let welcome = client.recv_type("welcome").await?;
    assert!(welcome["clientId"].is_number());
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn happy_local_send() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-1", None).await?;
    let mut architect = bus.connect().await?;
    architect.register("architect").await?;
    let mut builder = bus.connect().await?;
    let registered = builder.register("builder").await?;
    assert_eq!(registered["role"], "builder");
    assert_eq!(registered["paneId"], "2");

    architect.send_json(&send_frame("builder", "build x", "m1")).await?;

    let message = builder.recv_type("message").await?;
    assert_eq!(message["from"], "architect");
    assert_eq!(message["content"], "build x");
    assert!(message["traceId"].is_string());
    assert!(message["eventId"].is_string());

    let ack = architect.recv_type("send-ack").await?;
    assert_eq!(ack["messageId"], "m1");
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["verified"], true);
    assert_eq!(ack["wsDeliveryCount"], 1);
    assert_eq!(ack["status"], "delivered.websocket");
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn idempotent_retry() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-2", None).await?;
    let mut architect = bus.connect().await?;
    architect.register("architect").await?;
    let mut builder = bus.connect().await?;
    builder.register("builder").await?;

    for _ in 0..3 {
        architect.send_json(&send_frame("builder", "build x", "m1")).await?;
    }

    let first = architect.recv_type("send-ack").await?;
    let second = architect.recv_type("send-ack").await?;
    let third = architect.recv_type("send-ack").await?;

    for ack in [&second, &third] {
        assert_eq!(ack["ok"], first["ok"]);
        assert_eq!(ack["verified"], first["verified"]);
        assert_eq!(ack["status"], first["status"]);
        assert_eq!(ack["dedupe"]["mode"], "cache");
    }

    // Exactly one underlying delivery.
    assert!(builder.sees_type_within("message", Duration::from_millis(300)).await);
    assert!(!builder.sees_type_within("message", Duration::from_millis(300)).await);
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn queue_on_no_route_then_flush_on_register() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let queue_path = tmp.path().join("comms-outbound-queue.json");
    let bus = TestBus::start("scope-3", Some(queue_path.clone())).await?;

    let mut architect = bus.connect().await?;
    architect.register("architect").await?;
    architect.send_json(&send_frame("oracle", "read logs", "m2")).await?;

    let ack = architect.recv_type("send-ack").await?;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["verified"], false);
    assert_eq!(ack["accepted"], true);
    assert_eq!(ack["queued"], true);
    assert_eq!(ack["status"], "accepted.unverified");

    // The entry is on disk until someone claims it.
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&queue_path)?)?;
    assert_eq!(on_disk["entries"][0]["target"], "oracle");

    // A late oracle gets the replay immediately after registering.
    let mut oracle = bus.connect().await?;
    oracle.register("oracle").await?;
    let message = oracle.recv_type("message").await?;
    assert_eq!(message["content"], "read logs");
    assert_eq!(message["from"], "architect");

    // The queue file no longer contains the entry.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&queue_path)?)?;
        if on_disk["entries"].as_array().is_some_and(Vec::is_empty) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("queue file still holds the delivered entry");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn session_scope_gate_discards_previous_boot() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let queue_path = tmp.path().join("comms-outbound-queue.json");

    let bus = TestBus::start("scope-old", Some(queue_path.clone())).await?;
    let mut architect = bus.connect().await?;
    architect.register("architect").await?;
    architect.send_json(&send_frame("oracle", "stale instruction", "m-old")).await?;
    architect.recv_type("send-ack").await?;
    bus.stop().await;

    // Restart under a new scope: the old entry must not replay.
    let bus = TestBus::start("scope-new", Some(queue_path.clone())).await?;
    let mut oracle = bus.connect().await?;
    oracle.register("oracle").await?;
    assert!(!oracle.sees_type_within("message", Duration::from_millis(400)).await);

    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&queue_path)?)?;
    assert_eq!(on_disk["sessionScopeId"], "scope-new");
    assert_eq!(on_disk["entries"].as_array().map(Vec::len), Some(0));
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn rate_limit_drops_the_51st_frame() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-5", None).await?;
    let mut client = bus.connect().await?;
    client.recv_type("welcome").await?;

    for i in 0..51 {
        client.send_json(&send_frame("builder", "spam", &format!("m{i}"))).await?;
    }

    let error = client.recv_type("error").await?;
    assert_eq!(error["message"], "Rate limit exceeded");

    // The window clears, and the dropped frame never touched the caches.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    client.send_json(&json!({ "type": "delivery-check", "messageId": "m50" })).await?;
    let check = client.recv_type("delivery-check-result").await?;
    assert_eq!(check["known"], false);

    client.send_json(&json!({ "type": "delivery-check", "messageId": "m10" })).await?;
    let check = client.recv_type("delivery-check-result").await?;
    assert_eq!(check["known"], true);
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn delivery_check_observes_pending_then_resolved() -> anyhow::Result<()> {
    // A handler slow enough for a second connection to observe the
    // in-flight dispatch.
    let slow: MessageHandler = Arc::new(|_delivery| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(None)
        })
    });
    let bus = TestBus::start_with("scope-6", None, Some(slow)).await?;

    let mut sender = bus.connect().await?;
    sender.register("architect").await?;
    sender.send_json(&send_frame("oracle", "slow path", "m9")).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut checker = bus.connect().await?;
    checker.recv_type("welcome").await?;
    checker.send_json(&json!({ "type": "delivery-check", "messageId": "m9" })).await?;
    let check = checker.recv_type("delivery-check-result").await?;
    assert_eq!(check["known"], true);
    assert_eq!(check["pending"], true);

    let ack = sender.recv_type("send-ack").await?;
    assert_eq!(ack["status"], "accepted.unverified");

    checker.send_json(&json!({ "type": "delivery-check", "messageId": "m9" })).await?;
    let check = checker.recv_type("delivery-check-result").await?;
    assert_eq!(check["known"], true);
    assert_eq!(check["status"], "accepted.unverified");
    assert_eq!(check["ack"]["queued"], true);
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn oversize_frame_is_rejected_without_caching() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-7", None).await?;
    let mut client = bus.connect().await?;
    client.recv_type("welcome").await?;

    let huge = "x".repeat(300 * 1024);
    client.send_json(&send_frame("builder", &huge, "m-big")).await?;
    let error = client.recv_type("error").await?;
    assert_eq!(error["message"], "Frame exceeds size limit");

    client.send_json(&json!({ "type": "delivery-check", "messageId": "m-big" })).await?;
    let check = client.recv_type("delivery-check-result").await?;
    assert_eq!(check["known"], false);
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_fans_out_to_everyone_else() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-8", None).await?;
    let mut architect = bus.connect().await?;
    architect.register("architect").await?;
    let mut builder = bus.connect().await?;
    builder.register("builder").await?;
    let mut oracle = bus.connect().await?;
    oracle.register("oracle").await?;

    architect
        .send_json(&json!({
            "type": "broadcast",
            "content": "standup in 5",
            "messageId": "b1",
            "ackRequired": true,
        }))
        .await?;

    for peer in [&mut builder, &mut oracle] {
        let frame = peer.recv_type("broadcast").await?;
        assert_eq!(frame["from"], "architect");
        assert_eq!(frame["content"], "standup in 5");
    }
    let ack = architect.recv_type("send-ack").await?;
    assert_eq!(ack["wsDeliveryCount"], 2);
    assert_eq!(ack["ok"], true);
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn health_check_reports_route_state() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-9", None).await?;
    let mut architect = bus.connect().await?;
    architect.register("architect").await?;

    architect
        .send_json(&json!({ "type": "health-check", "target": "architect", "requestId": "r1" }))
        .await?;
    let result = architect.recv_type("health-check-result").await?;
    assert_eq!(result["healthy"], true);
    assert_eq!(result["status"], "healthy");
    assert_eq!(result["requestId"], "r1");
    assert_eq!(result["paneId"], "1");

    architect
        .send_json(&json!({ "type": "health-check", "target": "ghost-pane" }))
        .await?;
    let result = architect.recv_type("health-check-result").await?;
    assert_eq!(result["healthy"], false);
    assert_eq!(result["status"], "no_route");
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_frames_get_error_replies() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-10", None).await?;
    let mut client = bus.connect().await?;
    client.recv_type("welcome").await?;

    client.send_json(&json!({ "requestId": "r9", "payload": 1 })).await?;
    let error = client.recv_type("error").await?;
    assert_eq!(error["requestId"], "r9");

    // The connection survives protocol errors.
    client.send_json(&json!({ "type": "health-check", "target": "builder" })).await?;
    client.recv_type("health-check-result").await?;
    bus.stop().await;
    Ok(())
}

#[tokio::test]
async fn second_client_connection_also_receives_role_messages() -> anyhow::Result<()> {
    let bus = TestBus::start("scope-11", None).await?;
    let mut architect = bus.connect().await?;
    architect.register("architect").await?;

    // Two sessions share the builder role; both get the message.
    let mut builder_a = bus.connect().await?;
    builder_a.register("builder").await?;
    let mut builder_b = WsClient::connect(bus.addr).await?;
    builder_b.recv_type("welcome").await?;
    builder_b
        .send_json(&json!({ "type": "register", "role": "backend", "paneId": "bg-2-1" }))
        .await?;
    let registered = builder_b.recv_type("registered").await?;
    assert_eq!(registered["role"], "builder");

    architect.send_json(&send_frame("builder", "both of you", "m11")).await?;
    let ack = architect.recv_type("send-ack").await?;
    assert_eq!(ack["wsDeliveryCount"], 2);
    assert!(builder_a.sees_type_within("message", Duration::from_secs(2)).await);
    assert!(builder_b.sees_type_within("message", Duration::from_secs(2)).await);
    bus.stop().await;
    Ok(())
}
