// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use acp_bridge::{Gateway, Server, ServerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestGateway {
    pub ws_url: String,
    pub http_url: String,
    pub token: String,
    pub gateway: Arc<Gateway>,
    pub handle: JoinHandle<()>,
}

/// Spawn a gateway on port 0 wired to the mock agent binary.
pub async fn spawn_gateway() -> TestGateway {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        jwt_secret: "test-secret".to_string(),
        agent_cmd: Some(env!("CARGO_BIN_EXE_mock-agent").to_string()),
        ..ServerConfig::default()
    };
    let server = Server::new(config).await.expect("server");
    let addr = server.addr();
    let gateway = server.gateway();
    let token = gateway.tokens.issue("demo").expect("token");
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestGateway {
        ws_url: format!("ws://{addr}/ws"),
        http_url: format!("http://{addr}"),
        token,
        gateway,
        handle,
    }
}

/// Connect with the test token and consume the established envelope.
pub async fn connect(gw: &TestGateway) -> (WsClient, Value) {
    let url = format!("{}?token={}", gw.ws_url, gw.token);
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.expect("connect");
    let established = recv_envelope(&mut socket).await;
    assert_eq!(established["type"], "connection:established:success");
    (socket, established)
}

/// Connect with an arbitrary raw URL (bad-token paths).
pub async fn connect_raw(url: &str) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    socket
}

/// Receive the next text envelope within five seconds.
pub async fn recv_envelope(socket: &mut WsClient) -> Value {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        while let Some(frame) = socket.next().await {
            if let WsMessage::Text(text) = frame.expect("frame") {
                return serde_json::from_str(&text).expect("json envelope");
            }
        }
        panic!("socket closed while waiting for an envelope");
    })
    .await
    .expect("timed out waiting for an envelope")
}

/// Receive envelopes until one matches `pred`, within ten seconds.
pub async fn recv_until(socket: &mut WsClient, pred: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let envelope = recv_envelope(socket).await;
            if pred(&envelope) {
                return envelope;
            }
        }
    })
    .await
    .expect("timed out waiting for a matching envelope")
}

/// Send a request envelope with the given id.
pub async fn send_request(socket: &mut WsClient, id: &str, kind: &str, payload: Option<Value>) {
    let mut envelope = json!({
        "id": id,
        "type": kind,
        "timestamp": now_ms(),
    });
    if let Some(payload) = payload {
        envelope["payload"] = payload;
    }
    socket
        .send(WsMessage::Text(envelope.to_string()))
        .await
        .expect("send");
}

/// Create a session and return its id.
pub async fn create_session(socket: &mut WsClient) -> String {
    send_request(socket, &fresh_id(), "acp:session:create:request", None).await;
    let reply = recv_until(socket, |e| {
        e["type"] == "acp:session:create:success" || e["type"] == "acp:session:create:error"
    })
    .await;
    assert_eq!(reply["type"], "acp:session:create:success", "create failed: {reply}");
    reply["payload"]["sessionId"].as_str().expect("sessionId").to_string()
}

pub fn fresh_id() -> String {
    format!("req-{}", uuid_suffix())
}

fn uuid_suffix() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
}

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

/// Poll until `pred` holds or the deadline elapses.
pub async fn wait_for(mut pred: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pred()
}
