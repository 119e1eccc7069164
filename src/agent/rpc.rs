// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JSON-RPC correlator: matches agent responses to pending requests and
//! forwards everything else to the per-session notification handler.
//!
//! Prompts are fire-and-forget, so the final turn result arrives as an
//! id-bearing response with no pending entry; the correlator wraps it in a
//! synthetic `session/prompt` notification for the dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

use super::supervisor::{AgentError, AgentSupervisor};

/// Default deadline for a correlated request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Correlator error types
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("agent request timed out")]
    Timeout,

    #[error("Session closed")]
    SessionClosed,

    #[error("agent error: {message}")]
    Remote { code: i64, message: String },

    #[error("agent transport error: {0}")]
    Transport(String),
}

/// Message decoded for the session's notification handler.
#[derive(Debug, Clone)]
pub enum AgentNotice {
    /// Agent-sent notification, including the synthetic `session/prompt`
    /// completion wrapper.
    Notification { method: String, params: Value },
    /// Agent-initiated request (e.g. `session/request_permission`); `id` is
    /// the raw JSON-RPC id to echo in the eventual response.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
}

pub type NotificationHandler = Arc<dyn Fn(AgentNotice) + Send + Sync>;

struct PendingEntry {
    session_id: String,
    respond: oneshot::Sender<Result<Value, RpcError>>,
}

/// Pending-request table plus per-session notification handler slots.
pub struct RpcCorrelator {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingEntry>>,
    handlers: Mutex<HashMap<String, NotificationHandler>>,
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Register the notification handler for a session id. At most one
    /// handler per id; migration re-registers under the new id with closures
    /// capturing the new id.
    pub fn set_handler(&self, session_id: &str, handler: NotificationHandler) {
        self.handlers.lock().insert(session_id.to_string(), handler);
    }

    pub fn remove_handler(&self, session_id: &str) {
        self.handlers.lock().remove(session_id);
    }

    /// Send a request and await the matching response, with the default
    /// 30-second deadline.
    pub async fn request(
        &self,
        supervisor: &AgentSupervisor,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        self.request_with_timeout(supervisor, session_id, method, params, REQUEST_TIMEOUT).await
    }

    pub async fn request_with_timeout(
        &self,
        supervisor: &AgentSupervisor,
        session_id: &str,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingEntry {
                session_id: session_id.to_string(),
                respond: tx,
            },
        );

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = supervisor.send(session_id, &message).await {
            self.pending.lock().remove(&id);
            return Err(RpcError::Transport(err.to_string()));
        }

        match tokio::time::timeout(deadline, rx).await {
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RpcError::Timeout)
            }
            // Resolver dropped without firing: the session was torn down.
            Ok(Err(_)) => Err(RpcError::SessionClosed),
            Ok(Ok(result)) => result,
        }
    }

    /// Send a request without registering a pending entry. The response will
    /// surface through [`Self::on_message`]'s unknown-id branch as a
    /// synthetic notification. Returns the allocated JSON-RPC id.
    pub async fn send_detached(
        &self,
        supervisor: &AgentSupervisor,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<i64, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        supervisor.send(session_id, &message).await?;
        Ok(id)
    }

    /// Send a JSON-RPC notification (no id, no reply expected).
    pub async fn notify(
        &self,
        supervisor: &AgentSupervisor,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<(), AgentError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        supervisor.send(session_id, &message).await
    }

    /// Classify one inbound subprocess message and route it.
    pub fn on_message(&self, session_id: &str, message: Value) {
        let id = message.get("id").filter(|v| !v.is_null()).cloned();
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string);

        match (id, method) {
            (Some(id), Some(method)) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                self.forward(session_id, AgentNotice::Request { id, method, params });
            }
            (Some(id), None) => {
                let pending =
                    id.as_i64().and_then(|n| self.pending.lock().remove(&n));
                match pending {
                    Some(entry) => {
                        let outcome = if let Some(error) = message.get("error") {
                            Err(RpcError::Remote {
                                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(-32603),
                                message: error
                                    .get("message")
                                    .and_then(|m| m.as_str())
                                    .unwrap_or("unknown agent error")
                                    .to_string(),
                            })
                        } else {
                            Ok(message.get("result").cloned().unwrap_or(Value::Null))
                        };
                        let _ = entry.respond.send(outcome);
                    }
                    None => {
                        // Asynchronous response: the final result of a
                        // fire-and-forget prompt. Wrap it as a notification.
                        let params = if message.get("error").is_some() {
                            json!({"content": [], "stopReason": "error"})
                        } else {
                            message
                                .get("result")
                                .cloned()
                                .unwrap_or_else(|| json!({"content": [], "stopReason": "unknown"}))
                        };
                        self.forward(
                            session_id,
                            AgentNotice::Notification {
                                method: "session/prompt".to_string(),
                                params,
                            },
                        );
                    }
                }
            }
            (None, Some(method)) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                self.forward(session_id, AgentNotice::Notification { method, params });
            }
            (None, None) => {
                debug!(session_id, "dropping agent message with neither id nor method");
            }
        }
    }

    /// Reject every pending request belonging to `session_id`.
    pub fn fail_session(&self, session_id: &str) {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, entry)| entry.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in drained {
            let _ = entry.respond.send(Err(RpcError::SessionClosed));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn forward(&self, session_id: &str, notice: AgentNotice) {
        let handler = self.handlers.lock().get(session_id).cloned();
        match handler {
            Some(handler) => handler(notice),
            None => debug!(session_id, "no notification handler registered; dropping"),
        }
    }
}
