// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol dispatcher and session manager.
//!
//! Maps each validated client envelope to agent subprocess calls, routes the
//! resulting notifications back as translated envelopes, and enforces session
//! identity and ownership. The session-id migration during creation is the
//! delicate part: the session record, the session table, the supervisor
//! tables, and the correlator handler must all follow the rename before the
//! next stdout line is routed.

pub mod translator;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::rpc::{AgentNotice, NotificationHandler, RpcCorrelator};
use crate::agent::stderr::StderrKind;
use crate::agent::supervisor::{AgentSupervisor, ProcessStatus, SessionCallbacks, SpawnSpec};
use crate::connection::ConnectionRegistry;
use crate::error::ErrorCode;
use crate::protocol::envelope::{now_ms, Envelope, ErrorDetail, MessageType};
use crate::protocol::payloads::{
    self, default_permission_options, PermissionResponsePayload, PromptSendRequestPayload,
    SessionCreateRequestPayload, SessionModes, SessionScope,
};
use crate::protocol::PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Closed,
}

struct SessionRecord {
    connection_id: String,
    principal: String,
    cwd: Option<String>,
    model: Option<String>,
    status: SessionStatus,
    initialized: bool,
    auth_methods: Option<Value>,
    available_models: Vec<String>,
    current_model: String,
    modes: SessionModes,
}

struct PendingPrompt {
    request_id: String,
    connection_id: String,
    #[allow(dead_code)]
    created_at: u64,
}

/// The dispatcher: process-global session state behind one owner.
pub struct Dispatcher {
    connections: Arc<ConnectionRegistry>,
    supervisor: Arc<AgentSupervisor>,
    correlator: Arc<RpcCorrelator>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    pending_prompts: Mutex<HashMap<String, VecDeque<PendingPrompt>>>,
    pending_permissions: Mutex<HashMap<(String, String), Value>>,
    /// Self-handle for the callback closures registered with the supervisor
    /// and correlator.
    weak_self: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        supervisor: Arc<AgentSupervisor>,
        correlator: Arc<RpcCorrelator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            connections,
            supervisor,
            correlator,
            sessions: Mutex::new(HashMap::new()),
            pending_prompts: Mutex::new(HashMap::new()),
            pending_permissions: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Handle one parsed client envelope.
    pub async fn handle(&self, conn_id: &str, envelope: Envelope) {
        if let Err(err) = payloads::validate(envelope.kind, envelope.payload.as_ref()) {
            self.reply_error(conn_id, &envelope, ErrorCode::InvalidParams, err.to_string(), None);
            return;
        }

        match envelope.kind {
            MessageType::HeartbeatRequest => self.handle_heartbeat(conn_id, &envelope),
            MessageType::InitializeRequest => {
                self.reply_success(conn_id, &envelope, json!({"protocolVersion": PROTOCOL_VERSION}));
            }
            MessageType::SessionCreateRequest => {
                self.handle_session_create(conn_id, envelope).await;
            }
            MessageType::SessionLoadRequest => self.handle_session_load(conn_id, &envelope),
            MessageType::SessionCloseRequest => {
                self.handle_session_close(conn_id, envelope).await;
            }
            MessageType::PromptSendRequest => self.handle_prompt_send(conn_id, envelope).await,
            MessageType::PromptCancelRequest => {
                self.handle_prompt_cancel(conn_id, envelope).await;
            }
            MessageType::PermissionResponse => {
                self.handle_permission_response(conn_id, envelope).await;
            }
            _ => {
                self.reply_error(
                    conn_id,
                    &envelope,
                    ErrorCode::InvalidMessage,
                    format!("{} is not a client request", envelope.kind),
                    None,
                );
            }
        }
    }

    fn handle_heartbeat(&self, conn_id: &str, envelope: &Envelope) {
        let latency = now_ms().saturating_sub(envelope.timestamp);
        self.reply_success(conn_id, envelope, json!({"latency": latency}));
    }

    async fn handle_session_create(&self, conn_id: &str, envelope: Envelope) {
        let request: SessionCreateRequestPayload = envelope
            .payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();
        let Some(principal) = self.connections.principal(conn_id) else {
            return;
        };

        let tentative = Uuid::new_v4().to_string();
        self.sessions.lock().insert(
            tentative.clone(),
            SessionRecord {
                connection_id: conn_id.to_string(),
                principal,
                cwd: request.cwd.clone(),
                model: request.model.clone(),
                status: SessionStatus::Active,
                initialized: false,
                auth_methods: None,
                available_models: Vec::new(),
                current_model: request.model.clone().unwrap_or_else(|| "default".to_string()),
                modes: SessionModes::default(),
            },
        );
        self.connections.add_session(conn_id, &tentative);

        match self.run_session_handshake(&tentative, &request).await {
            Ok(session_id) => {
                let payload = {
                    let sessions = self.sessions.lock();
                    let record = sessions.get(&session_id);
                    if let Some(record) = record {
                        info!(
                            session_id = %session_id,
                            principal = %record.principal,
                            cwd = ?record.cwd,
                            model = ?record.model,
                            "session ready"
                        );
                    }
                    json!({
                        "sessionId": session_id,
                        "availableModels": record.map(|r| r.available_models.clone()).unwrap_or_default(),
                        "currentModel": record.map(|r| r.current_model.clone()).unwrap_or_default(),
                        "modes": record.map(|r| r.modes.clone()).unwrap_or_default(),
                    })
                };
                self.reply_success(conn_id, &envelope, payload);
            }
            Err((session_id, message)) => {
                warn!(session_id = %session_id, error = %message, "session creation failed");
                self.close_session(&session_id).await;
                self.reply_error(
                    conn_id,
                    &envelope,
                    ErrorCode::SessionCreateFailed,
                    message,
                    None,
                );
            }
        }
    }

    /// Drive the agent handshake for a freshly spawned session. Returns the
    /// final session id, which differs from the tentative one when the agent
    /// renamed the session in its `session/new` response.
    async fn run_session_handshake(
        &self,
        tentative: &str,
        request: &SessionCreateRequestPayload,
    ) -> Result<String, (String, String)> {
        let fail = |sid: &str, msg: String| (sid.to_string(), msg);

        self.supervisor
            .spawn(
                SpawnSpec {
                    session_id: tentative.to_string(),
                    cwd: request.cwd.clone(),
                    model: request.model.clone(),
                },
                self.session_callbacks(),
            )
            .map_err(|e| fail(tentative, format!("Failed to start agent: {e}")))?;
        self.correlator
            .set_handler(tentative, self.notification_handler(tentative.to_string()));

        let init = self
            .correlator
            .request(
                &self.supervisor,
                tentative,
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": {"name": "acp-bridge", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {},
                }),
            )
            .await
            .map_err(|e| fail(tentative, format!("Agent initialize failed: {e}")))?;

        {
            let mut sessions = self.sessions.lock();
            if let Some(record) = sessions.get_mut(tentative) {
                // Discovered auth methods are informational; their presence
                // does not by itself mean authentication is required.
                record.auth_methods = init.get("authMethods").cloned();
                record.initialized = true;
                debug!(
                    session_id = tentative,
                    auth_methods = ?record.auth_methods,
                    "agent initialized"
                );
            }
        }

        let cwd = request.cwd.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| ".".to_string())
        });
        let mut params = json!({"cwd": cwd, "mcpServers": []});
        if let Some(model) = &request.model {
            params["model"] = json!(model);
        }
        let created = self
            .correlator
            .request(&self.supervisor, tentative, "session/new", params)
            .await
            .map_err(|e| fail(tentative, format!("Agent session/new failed: {e}")))?;

        let session_id = created
            .get("sessionId")
            .and_then(|s| s.as_str())
            .unwrap_or(tentative)
            .to_string();
        if session_id != tentative {
            self.migrate_session(tentative, &session_id);
        }

        {
            let mut sessions = self.sessions.lock();
            if let Some(record) = sessions.get_mut(&session_id) {
                if let Some(models) = created.get("models").and_then(|m| m.as_array()) {
                    record.available_models = models
                        .iter()
                        .filter_map(|m| m.as_str().map(str::to_string))
                        .collect();
                }
                if record.available_models.is_empty() {
                    record.available_models = vec![record.current_model.clone()];
                }
                if let Some(model) = created.get("model").and_then(|m| m.as_str()) {
                    record.current_model = model.to_string();
                } else if let Some(first) = record.available_models.first() {
                    record.current_model = first.clone();
                }
                if let Some(modes) = created
                    .get("modes")
                    .and_then(|m| serde_json::from_value(m.clone()).ok())
                {
                    record.modes = modes;
                }
            }
        }
        self.supervisor.set_status(&session_id, ProcessStatus::Ready);
        Ok(session_id)
    }

    /// Atomic rename of a session id during creation.
    fn migrate_session(&self, old: &str, new: &str) {
        // The handler must be registered under the new id before the reader
        // can observe it, so no stdout line finds an empty slot.
        self.correlator.set_handler(new, self.notification_handler(new.to_string()));

        let connection_id = {
            let mut sessions = self.sessions.lock();
            sessions.remove(old).map(|record| {
                let connection_id = record.connection_id.clone();
                sessions.insert(new.to_string(), record);
                connection_id
            })
        };
        if let Some(connection_id) = connection_id {
            self.connections.rename_session(&connection_id, old, new);
        }

        if let Err(err) = self.supervisor.migrate(old, new) {
            warn!(old, new, error = %err, "supervisor migration failed");
        }
        self.correlator.remove_handler(old);

        {
            let mut prompts = self.pending_prompts.lock();
            if let Some(queue) = prompts.remove(old) {
                prompts.insert(new.to_string(), queue);
            }
        }

        debug!(old, new, "session id migrated");
    }

    fn handle_session_load(&self, conn_id: &str, envelope: &Envelope) {
        let Ok(scope) = self.parse_payload::<SessionScope>(&envelope.payload) else {
            return;
        };
        if let Err((code, message)) = self.check_ownership(conn_id, &scope.session_id) {
            self.reply_error(
                conn_id,
                envelope,
                code,
                message,
                Some(json!({"sessionId": scope.session_id})),
            );
            return;
        }
        let payload = {
            let sessions = self.sessions.lock();
            let record = sessions.get(&scope.session_id);
            json!({
                "sessionId": scope.session_id,
                "currentModel": record.map(|r| r.current_model.clone()).unwrap_or_default(),
                "modes": record.map(|r| r.modes.clone()).unwrap_or_default(),
            })
        };
        self.reply_success(conn_id, envelope, payload);
    }

    async fn handle_session_close(&self, conn_id: &str, envelope: Envelope) {
        let Ok(scope) = self.parse_payload::<SessionScope>(&envelope.payload) else {
            return;
        };

        enum CloseCheck {
            Missing,
            Foreign,
            Owned,
        }
        let check = {
            let sessions = self.sessions.lock();
            match sessions.get(&scope.session_id) {
                None => CloseCheck::Missing,
                Some(record) if record.connection_id != conn_id => CloseCheck::Foreign,
                Some(_) => CloseCheck::Owned,
            }
        };

        match check {
            // Repeated close is an ignorable no-op.
            CloseCheck::Missing => {
                self.reply_success(conn_id, &envelope, json!({"sessionId": scope.session_id}));
            }
            CloseCheck::Foreign => {
                self.reply_error(
                    conn_id,
                    &envelope,
                    ErrorCode::Unauthorized,
                    "Session is owned by another connection",
                    Some(json!({"sessionId": scope.session_id})),
                );
            }
            CloseCheck::Owned => {
                self.close_session(&scope.session_id).await;
                self.reply_success(conn_id, &envelope, json!({"sessionId": scope.session_id}));
            }
        }
    }

    async fn handle_prompt_send(&self, conn_id: &str, envelope: Envelope) {
        let Ok(request) = self.parse_payload::<PromptSendRequestPayload>(&envelope.payload) else {
            return;
        };
        if let Err((code, message)) = self.check_ownership(conn_id, &request.session_id) {
            self.reply_error(
                conn_id,
                &envelope,
                code,
                message,
                Some(json!({"sessionId": request.session_id, "requestId": envelope.id})),
            );
            return;
        }

        self.pending_prompts
            .lock()
            .entry(request.session_id.clone())
            .or_default()
            .push_back(PendingPrompt {
                request_id: envelope.id.clone(),
                connection_id: conn_id.to_string(),
                created_at: now_ms(),
            });

        // Acceptance is enqueued before the stdin write so it precedes every
        // streamed update for this prompt.
        self.reply_success(
            conn_id,
            &envelope,
            json!({"requestId": envelope.id, "status": "accepted"}),
        );

        let mut params = json!({
            "sessionId": request.session_id,
            "prompt": serde_json::to_value(&request.content).unwrap_or_else(|_| json!([])),
        });
        if let Some(mode) = &request.agent_mode {
            params["agentMode"] = json!(mode);
        }

        // Fire-and-forget: the reply surfaces later through the correlator's
        // unknown-id branch or as streamed updates.
        if let Err(err) = self
            .correlator
            .send_detached(&self.supervisor, &request.session_id, "session/prompt", params)
            .await
        {
            warn!(session_id = %request.session_id, error = %err, "prompt delivery failed");
            if let Some(queue) = self.pending_prompts.lock().get_mut(&request.session_id) {
                queue.retain(|p| p.request_id != envelope.id);
            }
            let error_envelope = Envelope::create_error(
                MessageType::PromptError,
                ErrorDetail::new(ErrorCode::Internal, "Failed to deliver prompt to agent")
                    .with_details(err.to_string()),
                Some(json!({"sessionId": request.session_id, "requestId": envelope.id})),
            );
            self.send_to_connection(conn_id, error_envelope);
        }
    }

    async fn handle_prompt_cancel(&self, conn_id: &str, envelope: Envelope) {
        let Ok(scope) = self.parse_payload::<SessionScope>(&envelope.payload) else {
            return;
        };
        if let Err((code, message)) = self.check_ownership(conn_id, &scope.session_id) {
            self.reply_error(
                conn_id,
                &envelope,
                code,
                message,
                Some(json!({"sessionId": scope.session_id})),
            );
            return;
        }

        // No wait: the agent acknowledges by finishing the turn with
        // stopReason = cancelled.
        if let Err(err) = self
            .correlator
            .notify(
                &self.supervisor,
                &scope.session_id,
                "session/cancel",
                json!({"sessionId": scope.session_id}),
            )
            .await
        {
            self.reply_error(
                conn_id,
                &envelope,
                ErrorCode::Internal,
                format!("Failed to deliver cancellation: {err}"),
                Some(json!({"sessionId": scope.session_id})),
            );
            return;
        }
        self.reply_success(conn_id, &envelope, json!({"sessionId": scope.session_id}));
    }

    async fn handle_permission_response(&self, conn_id: &str, envelope: Envelope) {
        let Ok(response) = self.parse_payload::<PermissionResponsePayload>(&envelope.payload)
        else {
            return;
        };
        if let Err((code, message)) = self.check_ownership(conn_id, &response.session_id) {
            self.reply_error(
                conn_id,
                &envelope,
                code,
                message,
                Some(json!({"sessionId": response.session_id})),
            );
            return;
        }

        let raw_id = self
            .pending_permissions
            .lock()
            .remove(&(response.session_id.clone(), response.request_id.clone()));
        let Some(raw_id) = raw_id else {
            self.reply_error(
                conn_id,
                &envelope,
                ErrorCode::InvalidParams,
                format!("No pending permission request {}", response.request_id),
                Some(json!({"sessionId": response.session_id})),
            );
            return;
        };

        let message = json!({
            "jsonrpc": "2.0",
            "id": raw_id,
            "result": {
                "outcome": serde_json::to_value(&response.outcome).unwrap_or(Value::Null),
            },
        });
        if let Err(err) = self.supervisor.send(&response.session_id, &message).await {
            warn!(session_id = %response.session_id, error = %err, "permission response delivery failed");
        }
    }

    /// Per-session supervisor callback slots. The stderr and close callbacks
    /// flow back in through methods on this dispatcher; the supervisor itself
    /// holds no dispatcher reference.
    fn session_callbacks(&self) -> SessionCallbacks {
        let correlator = Arc::clone(&self.correlator);
        let on_message = Arc::new(move |session_id: &str, message: Value| {
            correlator.on_message(session_id, message);
        });

        let weak = self.weak_self.clone();
        let on_stderr = Arc::new(move |session_id: &str, kind: StderrKind, line: &str| {
            if let Some(this) = weak.upgrade() {
                this.on_agent_stderr(session_id, kind, line);
            }
        });

        let weak = self.weak_self.clone();
        let on_close = Arc::new(move |session_id: &str, code: Option<i32>| {
            let Some(this) = weak.upgrade() else {
                return;
            };
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                this.on_agent_exit(&session_id, code).await;
            });
        });

        SessionCallbacks {
            on_message,
            on_stderr,
            on_close,
        }
    }

    /// Notification handler bound to one session id. Re-registered with a
    /// fresh capture on migration; a stale capture of the tentative id would
    /// route envelopes to a dead session.
    fn notification_handler(&self, session_id: String) -> NotificationHandler {
        let weak = self.weak_self.clone();
        Arc::new(move |notice| {
            if let Some(this) = weak.upgrade() {
                this.on_agent_notice(&session_id, notice);
            }
        })
    }

    fn on_agent_notice(&self, session_id: &str, notice: AgentNotice) {
        match notice {
            AgentNotice::Notification { method, params } => match method.as_str() {
                "session/update" => self.on_session_update(session_id, &params),
                "session/prompt" => self.on_prompt_complete(session_id, &params),
                other => debug!(session_id, method = other, "ignoring agent notification"),
            },
            AgentNotice::Request { id, method, params } => match method.as_str() {
                "session/request_permission" => {
                    self.on_permission_request(session_id, id, &params);
                }
                other => {
                    debug!(session_id, method = other, "rejecting unknown agent request");
                    let supervisor = Arc::clone(&self.supervisor);
                    let session_id = session_id.to_string();
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": "method not found"},
                    });
                    tokio::spawn(async move {
                        let _ = supervisor.send(&session_id, &response).await;
                    });
                }
            },
        }
    }

    fn on_session_update(&self, session_id: &str, params: &Value) {
        let Some(connection_id) = self.active_session_connection(session_id) else {
            return;
        };
        let update = params.get("update").cloned().unwrap_or(Value::Null);
        let translated = translator::translate_update(&update);
        let request_id = self
            .pending_prompts
            .lock()
            .get(session_id)
            .and_then(|queue| queue.front())
            .map(|prompt| prompt.request_id.clone());

        let mut payload = json!({"sessionId": session_id, "update": translated});
        if let Some(request_id) = request_id {
            payload["requestId"] = json!(request_id);
        }
        self.send_to_connection(
            &connection_id,
            Envelope::create(MessageType::PromptUpdate, Some(payload)),
        );
    }

    fn on_prompt_complete(&self, session_id: &str, params: &Value) {
        let Some(connection_id) = self.active_session_connection(session_id) else {
            return;
        };
        let completed = self
            .pending_prompts
            .lock()
            .get_mut(session_id)
            .and_then(|queue| queue.pop_front());
        let result = translator::translate_prompt_result(params);

        let mut payload = json!({
            "sessionId": session_id,
            "result": serde_json::to_value(&result).unwrap_or(Value::Null),
        });
        if let Some(prompt) = completed {
            payload["requestId"] = json!(prompt.request_id);
        }
        self.send_to_connection(
            &connection_id,
            Envelope::create(MessageType::PromptComplete, Some(payload)),
        );
    }

    fn on_permission_request(&self, session_id: &str, id: Value, params: &Value) {
        let Some(connection_id) = self.active_session_connection(session_id) else {
            return;
        };
        let request_id = match &id {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => return,
        };
        self.pending_permissions
            .lock()
            .insert((session_id.to_string(), request_id.clone()), id);

        let tool_call = params.get("toolCall").cloned().unwrap_or_else(|| json!({}));
        let options = params
            .get("options")
            .filter(|o| o.as_array().map(|a| !a.is_empty()).unwrap_or(false))
            .cloned()
            .unwrap_or_else(|| {
                serde_json::to_value(default_permission_options()).unwrap_or_else(|_| json!([]))
            });
        let payload = json!({
            "sessionId": session_id,
            "requestId": request_id,
            "toolCall": tool_call,
            "options": options,
        });
        self.send_to_connection(
            &connection_id,
            Envelope::create(MessageType::PermissionRequest, Some(payload)),
        );
    }

    fn on_agent_stderr(&self, session_id: &str, kind: StderrKind, line: &str) {
        let Some(connection_id) = self.active_session_connection(session_id) else {
            return;
        };
        let envelope = Envelope::create_error(
            MessageType::SessionError,
            ErrorDetail::new(ErrorCode::ApiError, kind.user_message()).with_details(line),
            Some(json!({"sessionId": session_id})),
        );
        self.send_to_connection(&connection_id, envelope);
    }

    /// Process exit observed by the supervisor. Deliberate closes are cleaned
    /// up by `close_session`; anything else is an abnormal death promoted to
    /// a session error.
    async fn on_agent_exit(&self, session_id: &str, code: Option<i32>) {
        let target = {
            let sessions = self.sessions.lock();
            sessions
                .get(session_id)
                .map(|record| (record.connection_id.clone(), record.status))
        };
        let Some((connection_id, status)) = target else {
            return;
        };
        if status == SessionStatus::Closed {
            return;
        }

        let message = match code {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process terminated unexpectedly".to_string(),
        };
        warn!(session_id, %message, "agent process died mid-session");
        let envelope = Envelope::create_error(
            MessageType::SessionError,
            ErrorDetail::new(ErrorCode::ProcessExited, message),
            Some(json!({"sessionId": session_id})),
        );
        self.send_to_connection(&connection_id, envelope);

        self.correlator.fail_session(session_id);
        self.remove_session_state(session_id);
    }

    /// Kill the subprocess and drop every table entry for the session. The
    /// future resolves after the process is reaped.
    pub async fn close_session(&self, session_id: &str) {
        {
            let mut sessions = self.sessions.lock();
            if let Some(record) = sessions.get_mut(session_id) {
                record.status = SessionStatus::Closed;
            }
        }
        self.correlator.fail_session(session_id);
        if let Err(err) = self.supervisor.kill(session_id).await {
            warn!(session_id, error = %err, "agent kill failed");
        }
        self.remove_session_state(session_id);
        debug!(session_id, "session closed");
    }

    /// Close every session owned by a dying connection and purge its pending
    /// prompts.
    pub async fn teardown_connection(&self, conn_id: &str, owned: Vec<String>) {
        for session_id in owned {
            self.close_session(&session_id).await;
        }
        let mut prompts = self.pending_prompts.lock();
        for queue in prompts.values_mut() {
            queue.retain(|prompt| prompt.connection_id != conn_id);
        }
        prompts.retain(|_, queue| !queue.is_empty());
    }

    fn remove_session_state(&self, session_id: &str) {
        let connection_id = self
            .sessions
            .lock()
            .remove(session_id)
            .map(|record| record.connection_id);
        if let Some(connection_id) = connection_id {
            self.connections.remove_session(&connection_id, session_id);
        }
        self.correlator.remove_handler(session_id);
        self.pending_prompts.lock().remove(session_id);
        self.pending_permissions
            .lock()
            .retain(|(sid, _), _| sid != session_id);
    }

    fn active_session_connection(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.lock();
        sessions.get(session_id).and_then(|record| {
            (record.status == SessionStatus::Active).then(|| record.connection_id.clone())
        })
    }

    fn check_ownership(&self, conn_id: &str, session_id: &str) -> Result<(), (ErrorCode, String)> {
        let sessions = self.sessions.lock();
        match sessions.get(session_id) {
            None => Err((ErrorCode::SessionNotFound, "Session not found".to_string())),
            Some(record) if record.status == SessionStatus::Closed || !record.initialized => {
                Err((ErrorCode::SessionNotFound, "Session not found".to_string()))
            }
            Some(record) if record.connection_id != conn_id => Err((
                ErrorCode::Unauthorized,
                "Session is owned by another connection".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }

    fn parse_payload<T: serde::de::DeserializeOwned>(
        &self,
        payload: &Option<Value>,
    ) -> Result<T, ()> {
        payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .ok_or(())
    }

    fn reply_success(&self, conn_id: &str, request: &Envelope, payload: Value) {
        if let Some(kind) = request.kind.success_sibling() {
            self.send_to_connection(conn_id, Envelope::create(kind, Some(payload)));
        }
    }

    fn reply_error(
        &self,
        conn_id: &str,
        request: &Envelope,
        code: ErrorCode,
        message: impl Into<String>,
        payload: Option<Value>,
    ) {
        let envelope = Envelope::create_error(
            request.kind.error_sibling(),
            ErrorDetail::new(code, message),
            payload,
        );
        self.send_to_connection(conn_id, envelope);
    }

    fn send_to_connection(&self, conn_id: &str, envelope: Envelope) {
        if !self.connections.send(conn_id, envelope) {
            debug!(conn_id, "dropping envelope for vanished connection");
        }
    }

    /// Number of live sessions (test observability).
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}
