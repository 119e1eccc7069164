// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use common::{
    now_ms, connect, connect_raw, fresh_id, recv_envelope, send_request, spawn_gateway,
};

mod common;

#[tokio::test]
async fn establishes_and_answers_heartbeat() {
    let gw = spawn_gateway().await;
    let (mut socket, established) = connect(&gw).await;

    let connection_id = established["payload"]["connectionId"].as_str().unwrap();
    assert!(!connection_id.is_empty());
    assert_eq!(established["payload"]["protocolVersion"], 1);

    send_request(&mut socket, "hb-1", "connection:heartbeat:request", None).await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["type"], "connection:heartbeat:success");
    assert!(reply["payload"]["latency"].is_u64());

    gw.handle.abort();
}

#[tokio::test]
async fn missing_token_closes_with_policy_violation() {
    let gw = spawn_gateway().await;
    let mut socket = connect_raw(&gw.ws_url).await;

    let frame = socket.next().await.expect("frame").expect("ok");
    match frame {
        WsMessage::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert_eq!(close.reason, "Authentication required");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    gw.handle.abort();
}

#[tokio::test]
async fn invalid_token_closes_with_policy_violation() {
    let gw = spawn_gateway().await;
    let mut socket = connect_raw(&format!("{}?token=garbage", gw.ws_url)).await;

    let frame = socket.next().await.expect("frame").expect("ok");
    match frame {
        WsMessage::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert_eq!(close.reason, "Invalid token");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    gw.handle.abort();
}

#[tokio::test]
async fn framing_errors_do_not_close_the_connection() {
    let gw = spawn_gateway().await;
    let (mut socket, _) = connect(&gw).await;

    // Malformed JSON
    socket
        .send(WsMessage::Text("{not json".to_string()))
        .await
        .expect("send");
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["type"], "system:error");
    assert_eq!(reply["error"]["code"], "INVALID_MESSAGE");

    // Missing type
    socket
        .send(WsMessage::Text(
            json!({"id": "x", "timestamp": now_ms()}).to_string(),
        ))
        .await
        .expect("send");
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["error"]["code"], "INVALID_MESSAGE");

    // Unknown type
    socket
        .send(WsMessage::Text(
            json!({"id": "x", "type": "acp:nonsense:request", "timestamp": now_ms()})
                .to_string(),
        ))
        .await
        .expect("send");
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["type"], "system:error");
    assert_eq!(reply["error"]["code"], "UNKNOWN_TYPE");

    // The connection is still serviceable.
    send_request(&mut socket, &fresh_id(), "connection:heartbeat:request", None).await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["type"], "connection:heartbeat:success");

    gw.handle.abort();
}

#[tokio::test]
async fn schema_violations_yield_invalid_params() {
    let gw = spawn_gateway().await;
    let (mut socket, _) = connect(&gw).await;

    // Unknown extra field on a closed schema.
    send_request(
        &mut socket,
        &fresh_id(),
        "acp:prompt:cancel:request",
        Some(json!({"sessionId": "s", "bogus": 1})),
    )
    .await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["type"], "acp:prompt:cancel:error");
    assert_eq!(reply["error"]["code"], "INVALID_PARAMS");

    // Server-emitted types are not client requests.
    send_request(
        &mut socket,
        &fresh_id(),
        "acp:prompt:send:success",
        Some(json!({"requestId": "r", "status": "accepted"})),
    )
    .await;
    let reply = recv_envelope(&mut socket).await;
    assert_eq!(reply["type"], "system:error");
    assert_eq!(reply["error"]["code"], "INVALID_MESSAGE");

    gw.handle.abort();
}
