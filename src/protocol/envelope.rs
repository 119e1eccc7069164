// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Envelope codec: the closed message-type vocabulary, envelope
//! construction, and error/success sibling derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Closed set of message types carried on the client socket.
///
/// The string form is `<domain>:<action>[:<status>]`; the suffix encodes the
/// envelope role (`:request`/`:success`/`:error` for the request-response
/// triads, bare event suffixes otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "connection:established:success")]
    ConnectionEstablished,
    #[serde(rename = "connection:heartbeat:request")]
    HeartbeatRequest,
    #[serde(rename = "connection:heartbeat:success")]
    HeartbeatSuccess,

    #[serde(rename = "acp:initialize:request")]
    InitializeRequest,
    #[serde(rename = "acp:initialize:success")]
    InitializeSuccess,
    #[serde(rename = "acp:initialize:error")]
    InitializeError,

    #[serde(rename = "acp:session:create:request")]
    SessionCreateRequest,
    #[serde(rename = "acp:session:create:success")]
    SessionCreateSuccess,
    #[serde(rename = "acp:session:create:error")]
    SessionCreateError,

    #[serde(rename = "acp:session:load:request")]
    SessionLoadRequest,
    #[serde(rename = "acp:session:load:success")]
    SessionLoadSuccess,
    #[serde(rename = "acp:session:load:error")]
    SessionLoadError,

    #[serde(rename = "acp:session:close:request")]
    SessionCloseRequest,
    #[serde(rename = "acp:session:close:success")]
    SessionCloseSuccess,
    #[serde(rename = "acp:session:close:error")]
    SessionCloseError,

    #[serde(rename = "acp:session:error")]
    SessionError,

    #[serde(rename = "acp:prompt:send:request")]
    PromptSendRequest,
    #[serde(rename = "acp:prompt:send:success")]
    PromptSendSuccess,
    #[serde(rename = "acp:prompt:send:error")]
    PromptSendError,

    #[serde(rename = "acp:prompt:update")]
    PromptUpdate,
    #[serde(rename = "acp:prompt:complete")]
    PromptComplete,
    #[serde(rename = "acp:prompt:error")]
    PromptError,

    #[serde(rename = "acp:prompt:cancel:request")]
    PromptCancelRequest,
    #[serde(rename = "acp:prompt:cancel:success")]
    PromptCancelSuccess,
    #[serde(rename = "acp:prompt:cancel:error")]
    PromptCancelError,

    #[serde(rename = "acp:permission:request")]
    PermissionRequest,
    #[serde(rename = "acp:permission:response")]
    PermissionResponse,

    #[serde(rename = "system:error")]
    SystemError,
}

/// Role encoded by a message type's suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Success,
    Error,
    Event,
}

impl MessageType {
    /// Parse the wire string form of a type. `None` for strings outside the
    /// closed vocabulary.
    pub fn from_type_str(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    /// Wire string form of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConnectionEstablished => "connection:established:success",
            MessageType::HeartbeatRequest => "connection:heartbeat:request",
            MessageType::HeartbeatSuccess => "connection:heartbeat:success",
            MessageType::InitializeRequest => "acp:initialize:request",
            MessageType::InitializeSuccess => "acp:initialize:success",
            MessageType::InitializeError => "acp:initialize:error",
            MessageType::SessionCreateRequest => "acp:session:create:request",
            MessageType::SessionCreateSuccess => "acp:session:create:success",
            MessageType::SessionCreateError => "acp:session:create:error",
            MessageType::SessionLoadRequest => "acp:session:load:request",
            MessageType::SessionLoadSuccess => "acp:session:load:success",
            MessageType::SessionLoadError => "acp:session:load:error",
            MessageType::SessionCloseRequest => "acp:session:close:request",
            MessageType::SessionCloseSuccess => "acp:session:close:success",
            MessageType::SessionCloseError => "acp:session:close:error",
            MessageType::SessionError => "acp:session:error",
            MessageType::PromptSendRequest => "acp:prompt:send:request",
            MessageType::PromptSendSuccess => "acp:prompt:send:success",
            MessageType::PromptSendError => "acp:prompt:send:error",
            MessageType::PromptUpdate => "acp:prompt:update",
            MessageType::PromptComplete => "acp:prompt:complete",
            MessageType::PromptError => "acp:prompt:error",
            MessageType::PromptCancelRequest => "acp:prompt:cancel:request",
            MessageType::PromptCancelSuccess => "acp:prompt:cancel:success",
            MessageType::PromptCancelError => "acp:prompt:cancel:error",
            MessageType::PermissionRequest => "acp:permission:request",
            MessageType::PermissionResponse => "acp:permission:response",
            MessageType::SystemError => "system:error",
        }
    }

    /// Role encoded by the type suffix.
    pub fn role(&self) -> Role {
        let s = self.as_str();
        if s.ends_with(":request") {
            Role::Request
        } else if s.ends_with(":success") {
            Role::Success
        } else if s.ends_with(":error") {
            Role::Error
        } else {
            Role::Event
        }
    }

    /// Error sibling of a request type: `x:y:request` maps to `x:y:error`
    /// when that enumerant exists, otherwise `system:error`.
    pub fn error_sibling(&self) -> MessageType {
        match self {
            MessageType::InitializeRequest => MessageType::InitializeError,
            MessageType::SessionCreateRequest => MessageType::SessionCreateError,
            MessageType::SessionLoadRequest => MessageType::SessionLoadError,
            MessageType::SessionCloseRequest => MessageType::SessionCloseError,
            MessageType::PromptSendRequest => MessageType::PromptSendError,
            MessageType::PromptCancelRequest => MessageType::PromptCancelError,
            _ => MessageType::SystemError,
        }
    }

    /// Success sibling of a request type, when one exists.
    pub fn success_sibling(&self) -> Option<MessageType> {
        match self {
            MessageType::HeartbeatRequest => Some(MessageType::HeartbeatSuccess),
            MessageType::InitializeRequest => Some(MessageType::InitializeSuccess),
            MessageType::SessionCreateRequest => Some(MessageType::SessionCreateSuccess),
            MessageType::SessionLoadRequest => Some(MessageType::SessionLoadSuccess),
            MessageType::SessionCloseRequest => Some(MessageType::SessionCloseSuccess),
            MessageType::PromptSendRequest => Some(MessageType::PromptSendSuccess),
            MessageType::PromptCancelRequest => Some(MessageType::PromptCancelSuccess),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error object carried by error envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// A single typed message at the client boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Failures distinguishing the framing error codes of §4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundError {
    /// Frame is not valid JSON
    MalformedJson,
    /// JSON object lacks a `type` field
    MissingType,
    /// `type` is a string outside the closed vocabulary
    UnknownType(String),
    /// Envelope fields are structurally invalid (missing id, bad timestamp)
    InvalidEnvelope(String),
}

impl Envelope {
    /// Construct a well-formed envelope with a fresh id and the current
    /// wall-clock timestamp.
    pub fn create(kind: MessageType, payload: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: now_ms(),
            payload,
            error: None,
        }
    }

    /// Construct an error envelope for `kind` carrying `error` and an
    /// optional session-scoped payload.
    pub fn create_error(kind: MessageType, error: ErrorDetail, payload: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: now_ms(),
            payload,
            error: Some(error),
        }
    }

    /// Parse one inbound text frame, distinguishing the framing failures the
    /// connection server must report separately.
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value =
            serde_json::from_str(text).map_err(|_| InboundError::MalformedJson)?;
        let type_str = match value.get("type") {
            Some(Value::String(s)) => s.clone(),
            Some(_) | None => return Err(InboundError::MissingType),
        };
        if MessageType::from_type_str(&type_str).is_none() {
            return Err(InboundError::UnknownType(type_str));
        }
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| InboundError::InvalidEnvelope(e.to_string()))?;
        if envelope.id.is_empty() {
            return Err(InboundError::InvalidEnvelope("empty id".to_string()));
        }
        if envelope.timestamp == 0 {
            return Err(InboundError::InvalidEnvelope(
                "timestamp must be a positive integer".to_string(),
            ));
        }
        Ok(envelope)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_strings_round_trip() {
        let all = [
            MessageType::ConnectionEstablished,
            MessageType::HeartbeatRequest,
            MessageType::HeartbeatSuccess,
            MessageType::InitializeRequest,
            MessageType::InitializeSuccess,
            MessageType::InitializeError,
            MessageType::SessionCreateRequest,
            MessageType::SessionCreateSuccess,
            MessageType::SessionCreateError,
            MessageType::SessionLoadRequest,
            MessageType::SessionLoadSuccess,
            MessageType::SessionLoadError,
            MessageType::SessionCloseRequest,
            MessageType::SessionCloseSuccess,
            MessageType::SessionCloseError,
            MessageType::SessionError,
            MessageType::PromptSendRequest,
            MessageType::PromptSendSuccess,
            MessageType::PromptSendError,
            MessageType::PromptUpdate,
            MessageType::PromptComplete,
            MessageType::PromptError,
            MessageType::PromptCancelRequest,
            MessageType::PromptCancelSuccess,
            MessageType::PromptCancelError,
            MessageType::PermissionRequest,
            MessageType::PermissionResponse,
            MessageType::SystemError,
        ];
        for kind in all {
            assert_eq!(MessageType::from_type_str(kind.as_str()), Some(kind));
            let serialized = serde_json::to_value(kind).unwrap();
            assert_eq!(serialized, Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn role_follows_suffix() {
        assert_eq!(MessageType::SessionCreateRequest.role(), Role::Request);
        assert_eq!(MessageType::SessionCreateSuccess.role(), Role::Success);
        assert_eq!(MessageType::SessionCreateError.role(), Role::Error);
        assert_eq!(MessageType::PromptUpdate.role(), Role::Event);
        assert_eq!(MessageType::PromptComplete.role(), Role::Event);
        assert_eq!(MessageType::SessionError.role(), Role::Error);
    }

    #[test]
    fn error_sibling_derivation() {
        assert_eq!(
            MessageType::PromptSendRequest.error_sibling(),
            MessageType::PromptSendError
        );
        assert_eq!(
            MessageType::SessionCreateRequest.error_sibling(),
            MessageType::SessionCreateError
        );
        // No matching suffix: falls back to system:error.
        assert_eq!(
            MessageType::HeartbeatRequest.error_sibling(),
            MessageType::SystemError
        );
        assert_eq!(
            MessageType::PermissionResponse.error_sibling(),
            MessageType::SystemError
        );
    }

    #[test]
    fn success_sibling_derivation() {
        assert_eq!(
            MessageType::SessionCloseRequest.success_sibling(),
            Some(MessageType::SessionCloseSuccess)
        );
        assert_eq!(MessageType::PromptUpdate.success_sibling(), None);
    }

    #[test]
    fn create_produces_fresh_ids_and_timestamps() {
        let a = Envelope::create(MessageType::SystemError, None);
        let b = Envelope::create(MessageType::SystemError, None);
        assert_ne!(a.id, b.id);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn parse_distinguishes_framing_failures() {
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(InboundError::MalformedJson)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"id":"x","timestamp":1}"#),
            Err(InboundError::MissingType)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"id":"x","type":"acp:bogus","timestamp":1}"#),
            Err(InboundError::UnknownType(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"id":"x","type":"connection:heartbeat:request","timestamp":0}"#),
            Err(InboundError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn parse_accepts_well_formed_envelope() {
        let text = json!({
            "id": "req-1",
            "type": "acp:prompt:cancel:request",
            "timestamp": 1700000000000u64,
            "payload": {"sessionId": "s"}
        })
        .to_string();
        let envelope = Envelope::parse(&text).unwrap();
        assert_eq!(envelope.kind, MessageType::PromptCancelRequest);
        assert_eq!(envelope.id, "req-1");
    }

    #[test]
    fn error_envelope_may_carry_payload() {
        let envelope = Envelope::create_error(
            MessageType::SessionError,
            ErrorDetail::new(crate::error::ErrorCode::ApiError, "Rate limit exceeded"),
            Some(json!({"sessionId": "s"})),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["error"]["code"], "API_ERROR");
        assert_eq!(value["payload"]["sessionId"], "s");
    }
}
