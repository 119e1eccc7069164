// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection server: authenticated WebSocket lifecycle, per-connection
//! liveness, and the connection registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::protocol::envelope::{Envelope, ErrorDetail, InboundError, MessageType};
use crate::protocol::PROTOCOL_VERSION;
use crate::state::Gateway;

/// Liveness check interval; any application traffic or pong resets it.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// WebSocket close code for policy violations (auth failures).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

struct ConnectionEntry {
    principal: String,
    sessions: HashSet<String>,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Process-global table of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, conn_id: &str, principal: &str, tx: mpsc::UnboundedSender<Envelope>) {
        self.inner.lock().insert(
            conn_id.to_string(),
            ConnectionEntry {
                principal: principal.to_string(),
                sessions: HashSet::new(),
                tx,
            },
        );
    }

    fn remove(&self, conn_id: &str) -> Option<(String, Vec<String>)> {
        self.inner
            .lock()
            .remove(conn_id)
            .map(|entry| (entry.principal, entry.sessions.into_iter().collect()))
    }

    /// Enqueue an envelope to a connection's writer. `false` when the
    /// connection is gone; the caller drops the envelope.
    pub fn send(&self, conn_id: &str, envelope: Envelope) -> bool {
        match self.inner.lock().get(conn_id) {
            Some(entry) => entry.tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn principal(&self, conn_id: &str) -> Option<String> {
        self.inner.lock().get(conn_id).map(|e| e.principal.clone())
    }

    pub fn add_session(&self, conn_id: &str, session_id: &str) {
        if let Some(entry) = self.inner.lock().get_mut(conn_id) {
            entry.sessions.insert(session_id.to_string());
        }
    }

    pub fn remove_session(&self, conn_id: &str, session_id: &str) {
        if let Some(entry) = self.inner.lock().get_mut(conn_id) {
            entry.sessions.remove(session_id);
        }
    }

    pub fn rename_session(&self, conn_id: &str, old: &str, new: &str) {
        if let Some(entry) = self.inner.lock().get_mut(conn_id) {
            entry.sessions.remove(old);
            entry.sessions.insert(new.to_string());
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Union of owned-session sets (test observability for the no-orphans
    /// invariant).
    pub fn owned_session_count(&self) -> usize {
        self.inner.lock().values().map(|e| e.sessions.len()).sum()
    }
}

/// Drive one upgraded WebSocket to completion.
pub async fn run_connection(socket: WebSocket, gateway: Arc<Gateway>, token: Option<String>) {
    let mut socket = socket;
    let principal = match token {
        None => {
            close_policy_violation(&mut socket, "Authentication required").await;
            return;
        }
        Some(token) => match gateway.tokens.verify(&token) {
            Ok(claims) => claims.sub,
            Err(_) => {
                close_policy_violation(&mut socket, "Invalid token").await;
                return;
            }
        },
    };

    let conn_id = Uuid::new_v4().to_string();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    gateway.connections.register(&conn_id, &principal, tx);
    info!(conn_id = %conn_id, principal = %principal, "connection established");

    let (mut sender, mut receiver) = socket.split();
    let established = Envelope::create(
        MessageType::ConnectionEstablished,
        Some(json!({"connectionId": conn_id, "protocolVersion": PROTOCOL_VERSION})),
    );
    if send_envelope(&mut sender, &established).await.is_err() {
        teardown(&gateway, &conn_id).await;
        return;
    }

    let mut alive = true;
    let mut liveness = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = liveness.tick() => {
                if !alive {
                    debug!(conn_id = %conn_id, "liveness expired; terminating");
                    break;
                }
                alive = false;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(envelope) => {
                        if send_envelope(&mut sender, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        alive = true;
                        handle_frame(&gateway, &conn_id, &text);
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        alive = true;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        alive = true;
                        send_frame_error(
                            &gateway,
                            &conn_id,
                            ErrorCode::InvalidMessage,
                            "Frames must be UTF-8 JSON text",
                        );
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    teardown(&gateway, &conn_id).await;
}

/// Parse one text frame and hand it to the dispatcher. Application-level
/// validation failures never close the connection.
fn handle_frame(gateway: &Arc<Gateway>, conn_id: &str, text: &str) {
    match Envelope::parse(text) {
        Ok(envelope) => {
            let dispatcher = Arc::clone(&gateway.dispatcher);
            let conn_id = conn_id.to_string();
            tokio::spawn(async move {
                dispatcher.handle(&conn_id, envelope).await;
            });
        }
        Err(InboundError::MalformedJson) => {
            send_frame_error(gateway, conn_id, ErrorCode::InvalidMessage, "Malformed JSON frame");
        }
        Err(InboundError::MissingType) => {
            send_frame_error(gateway, conn_id, ErrorCode::InvalidMessage, "Envelope has no type");
        }
        Err(InboundError::UnknownType(kind)) => {
            send_frame_error(
                gateway,
                conn_id,
                ErrorCode::UnknownType,
                format!("Unknown message type: {kind}"),
            );
        }
        Err(InboundError::InvalidEnvelope(message)) => {
            send_frame_error(gateway, conn_id, ErrorCode::InvalidMessage, message);
        }
    }
}

fn send_frame_error(
    gateway: &Arc<Gateway>,
    conn_id: &str,
    code: ErrorCode,
    message: impl Into<String>,
) {
    let envelope = Envelope::create_error(
        MessageType::SystemError,
        ErrorDetail::new(code, message),
        None,
    );
    gateway.connections.send(conn_id, envelope);
}

async fn teardown(gateway: &Arc<Gateway>, conn_id: &str) {
    if let Some((_, owned)) = gateway.connections.remove(conn_id) {
        info!(conn_id = %conn_id, sessions = owned.len(), "connection closed");
        gateway.dispatcher.teardown_connection(conn_id, owned).await;
    }
}

async fn send_envelope(
    sender: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), ()> {
    let text = serde_json::to_string(envelope).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

async fn close_policy_violation(socket: &mut WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_sessions_per_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("c1", "demo", tx);

        registry.add_session("c1", "s1");
        registry.add_session("c1", "s2");
        assert_eq!(registry.owned_session_count(), 2);

        registry.rename_session("c1", "s1", "s1-renamed");
        assert_eq!(registry.owned_session_count(), 2);

        registry.remove_session("c1", "s2");
        assert_eq!(registry.owned_session_count(), 1);

        let (_, sessions) = registry.remove("c1").expect("entry");
        assert_eq!(sessions, vec!["s1-renamed".to_string()]);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn send_to_missing_connection_reports_failure() {
        let registry = ConnectionRegistry::new();
        let envelope = Envelope::create(MessageType::SystemError, None);
        assert!(!registry.send("ghost", envelope));
    }
}
