// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Structural payload schemas for every message type in the vocabulary.
//!
//! Schemas are structural, not nominal: unknown fields are rejected,
//! missing required fields fail, and enumerations are closed. The
//! [`validate`] registry covers server-emitted types too, so
//! `validate(t, create_message(t, p).payload)` holds for every valid `p`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::MessageType;

/// Schema validation failure; the message names the offending field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Validate `payload` against the schema registered for `kind`.
pub fn validate(kind: MessageType, payload: Option<&Value>) -> Result<(), ValidationError> {
    match kind {
        MessageType::ConnectionEstablished => required::<EstablishedPayload>(payload),
        MessageType::HeartbeatRequest => optional::<EmptyPayload>(payload),
        MessageType::HeartbeatSuccess => required::<HeartbeatSuccessPayload>(payload),
        MessageType::InitializeRequest => optional::<InitializeRequestPayload>(payload),
        MessageType::InitializeSuccess => required::<InitializeSuccessPayload>(payload),
        MessageType::InitializeError => optional::<EmptyPayload>(payload),
        MessageType::SessionCreateRequest => optional::<SessionCreateRequestPayload>(payload),
        MessageType::SessionCreateSuccess => required::<SessionCreateSuccessPayload>(payload),
        MessageType::SessionCreateError
        | MessageType::SessionLoadError
        | MessageType::SessionCloseError
        | MessageType::PromptCancelError => optional::<SessionScope>(payload),
        MessageType::SessionLoadRequest
        | MessageType::SessionCloseRequest
        | MessageType::SessionCloseSuccess
        | MessageType::SessionError
        | MessageType::PromptCancelRequest
        | MessageType::PromptCancelSuccess => required::<SessionScope>(payload),
        MessageType::SessionLoadSuccess => required::<SessionLoadSuccessPayload>(payload),
        MessageType::PromptSendRequest => required::<PromptSendRequestPayload>(payload),
        MessageType::PromptSendSuccess => required::<PromptSendSuccessPayload>(payload),
        MessageType::PromptSendError | MessageType::PromptError => {
            optional::<PromptScope>(payload)
        }
        MessageType::PromptUpdate => required::<PromptUpdatePayload>(payload),
        MessageType::PromptComplete => required::<PromptCompletePayload>(payload),
        MessageType::PermissionRequest => required::<PermissionRequestPayload>(payload),
        MessageType::PermissionResponse => required::<PermissionResponsePayload>(payload),
        MessageType::SystemError => optional::<EmptyPayload>(payload),
    }
}

fn required<T: serde::de::DeserializeOwned>(
    payload: Option<&Value>,
) -> Result<(), ValidationError> {
    match payload {
        Some(value) => serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|e| ValidationError::new(e.to_string())),
        None => Err(ValidationError::new("payload is required")),
    }
}

fn optional<T: serde::de::DeserializeOwned>(
    payload: Option<&Value>,
) -> Result<(), ValidationError> {
    match payload {
        Some(value) => serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|e| ValidationError::new(e.to_string())),
        None => Ok(()),
    }
}

/// Payload that must be an empty object when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EstablishedPayload {
    pub connection_id: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeartbeatSuccessPayload {
    pub latency: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitializeRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InitializeSuccessPayload {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionCreateRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionCreateSuccessPayload {
    pub session_id: String,
    pub available_models: Vec<String>,
    pub current_model: String,
    pub modes: SessionModes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionModes {
    pub current_mode_id: String,
    pub available_modes: Vec<ModeDescriptor>,
}

impl Default for SessionModes {
    fn default() -> Self {
        Self {
            current_mode_id: "build".to_string(),
            available_modes: vec![
                ModeDescriptor {
                    id: "ask".to_string(),
                    name: "Ask".to_string(),
                },
                ModeDescriptor {
                    id: "build".to_string(),
                    name: "Build".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeDescriptor {
    pub id: String,
    pub name: String,
}

/// Payload carrying only a session id (close/cancel/session-error scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionScope {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionLoadSuccessPayload {
    pub session_id: String,
    pub current_model: String,
    pub modes: SessionModes,
}

/// Content blocks accepted in prompts. The enumeration is closed; only text
/// content crosses this boundary (no file upload transport).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptSendRequestPayload {
    pub session_id: String,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptSendSuccessPayload {
    pub request_id: String,
    pub status: PromptAccepted,
}

/// Status of an accepted prompt; closed single-value enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptAccepted {
    Accepted,
}

/// Optional prompt-scoped identifiers carried by `acp:prompt:*:error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptUpdatePayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub update: UpdateBody,
}

/// Translated streaming update. `kind` is the discriminator; the remaining
/// fields are variant-specific and carried through as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBody {
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptCompletePayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub result: PromptResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PromptResult {
    pub content: Vec<Value>,
    pub stop_reason: StopReason,
}

/// Closed set of turn stop reasons visible to the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Cancelled,
    Error,
}

impl StopReason {
    /// Normalize an agent-reported stop reason; anything outside the closed
    /// set (including the correlator's synthetic "unknown") becomes
    /// `end_turn`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw {
            Some("tool_use") => StopReason::ToolUse,
            Some("cancelled") => StopReason::Cancelled,
            Some("error") => StopReason::Error,
            _ => StopReason::EndTurn,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionRequestPayload {
    pub session_id: String,
    pub request_id: String,
    pub tool_call: Value,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Options injected when the agent omits them from a permission request.
pub fn default_permission_options() -> Vec<PermissionOption> {
    vec![
        PermissionOption {
            option_id: "allow".to_string(),
            name: "Allow".to_string(),
            kind: Some("allow_once".to_string()),
        },
        PermissionOption {
            option_id: "reject".to_string(),
            name: "Reject".to_string(),
            kind: Some("reject_once".to_string()),
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionResponsePayload {
    pub session_id: String,
    pub request_id: String,
    pub outcome: PermissionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PermissionOutcome {
    pub outcome: PermissionOutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcomeKind {
    Selected,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extra_fields_are_rejected() {
        let err = validate(
            MessageType::PromptCancelRequest,
            Some(&json!({"sessionId": "s", "extra": true})),
        );
        assert!(err.is_err());
    }

    #[test]
    fn missing_required_fields_fail() {
        assert!(validate(MessageType::PromptSendRequest, Some(&json!({"sessionId": "s"}))).is_err());
        assert!(validate(MessageType::SessionCloseRequest, None).is_err());
    }

    #[test]
    fn content_enumeration_is_closed() {
        let payload = json!({
            "sessionId": "s",
            "content": [{"type": "image", "data": "..."}]
        });
        assert!(validate(MessageType::PromptSendRequest, Some(&payload)).is_err());

        let payload = json!({
            "sessionId": "s",
            "content": [{"type": "text", "text": "hi"}]
        });
        assert!(validate(MessageType::PromptSendRequest, Some(&payload)).is_ok());
    }

    #[test]
    fn optional_payloads_accept_absence() {
        assert!(validate(MessageType::HeartbeatRequest, None).is_ok());
        assert!(validate(MessageType::SessionCreateRequest, None).is_ok());
        assert!(validate(MessageType::SessionCreateRequest, Some(&json!({"cwd": "/tmp"}))).is_ok());
        assert!(validate(MessageType::HeartbeatRequest, Some(&json!({"x": 1}))).is_err());
    }

    #[test]
    fn created_messages_validate() {
        use crate::protocol::envelope::Envelope;

        let cases = [
            (
                MessageType::SessionCreateSuccess,
                json!({
                    "sessionId": "s",
                    "availableModels": ["m1"],
                    "currentModel": "m1",
                    "modes": SessionModes::default()
                }),
            ),
            (
                MessageType::PromptSendSuccess,
                json!({"requestId": "r1", "status": "accepted"}),
            ),
            (
                MessageType::PromptUpdate,
                json!({
                    "sessionId": "s",
                    "requestId": "r1",
                    "update": {"kind": "agent_message_chunk", "content": {"type": "text", "text": "hi"}}
                }),
            ),
            (
                MessageType::PromptComplete,
                json!({
                    "sessionId": "s",
                    "requestId": "r1",
                    "result": {"content": [], "stopReason": "end_turn"}
                }),
            ),
            (
                MessageType::PermissionRequest,
                json!({
                    "sessionId": "s",
                    "requestId": "7",
                    "toolCall": {"toolCallId": "t1"},
                    "options": default_permission_options()
                }),
            ),
        ];
        for (kind, payload) in cases {
            let envelope = Envelope::create(kind, Some(payload));
            assert!(
                validate(kind, envelope.payload.as_ref()).is_ok(),
                "schema for {kind} rejected its own constructed payload"
            );
        }
    }

    #[test]
    fn stop_reason_normalization() {
        assert_eq!(StopReason::normalize(Some("end_turn")), StopReason::EndTurn);
        assert_eq!(StopReason::normalize(Some("tool_use")), StopReason::ToolUse);
        assert_eq!(StopReason::normalize(Some("cancelled")), StopReason::Cancelled);
        assert_eq!(StopReason::normalize(Some("error")), StopReason::Error);
        assert_eq!(StopReason::normalize(Some("unknown")), StopReason::EndTurn);
        assert_eq!(StopReason::normalize(None), StopReason::EndTurn);
    }
}
