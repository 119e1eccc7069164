// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pure translation of agent `session/update` notification variants into
//! the client-side update objects.
//!
//! The agent discriminates variants with a `sessionUpdate` field; the client
//! side uses `kind`. Translation is a pure function over one notification;
//! ordering is carried by the single-reader stdout loop, not here.

use serde_json::{json, Map, Value};

use crate::protocol::payloads::{PromptResult, StopReason};

/// Translate one agent update object into the client update shape.
/// Unknown kinds are forwarded with `kind` set to the raw discriminator and
/// the remaining fields preserved.
pub fn translate_update(update: &Value) -> Value {
    let kind = update
        .get("sessionUpdate")
        .and_then(|k| k.as_str())
        .unwrap_or("unknown");

    match kind {
        "agent_message_chunk" => json!({
            "kind": "agent_message_chunk",
            "content": update.get("content").cloned().unwrap_or(Value::Null),
        }),
        "agent_thought_chunk" | "thought_chunk" => {
            let text = update
                .pointer("/content/text")
                .and_then(|t| t.as_str())
                .unwrap_or_default();
            json!({
                "kind": "thought_chunk",
                "content": {"thought": text},
            })
        }
        "tool_call" => json!({
            "kind": "tool_call",
            "toolCall": {
                "toolCallId": update.get("toolCallId").cloned().unwrap_or(Value::Null),
                "toolName": update
                    .get("toolName")
                    .or_else(|| update.get("title"))
                    .cloned()
                    .unwrap_or(Value::Null),
                "arguments": update
                    .get("arguments")
                    .or_else(|| update.get("rawInput"))
                    .cloned()
                    .unwrap_or_else(|| json!({})),
                "status": update.get("status").cloned().unwrap_or_else(|| json!("pending")),
            },
        }),
        "tool_call_update" => {
            let status = update
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("in_progress");
            let mut tool_call = Map::new();
            tool_call.insert(
                "toolCallId".to_string(),
                update.get("toolCallId").cloned().unwrap_or(Value::Null),
            );
            tool_call.insert("status".to_string(), json!(status));
            if status == "error" {
                if let Some(error) = update
                    .get("error")
                    .or_else(|| update.pointer("/result/error"))
                {
                    tool_call.insert("error".to_string(), error.clone());
                }
            } else if let Some(output) = update
                .get("content")
                .or_else(|| update.pointer("/result/content"))
            {
                tool_call.insert("output".to_string(), output.clone());
            }
            json!({
                "kind": "tool_call_update",
                "toolCall": Value::Object(tool_call),
            })
        }
        "plan" => {
            let steps = update
                .get("entries")
                .or_else(|| update.get("steps"))
                .cloned()
                .unwrap_or_else(|| json!([]));
            json!({
                "kind": "plan",
                "plan": {"steps": steps},
            })
        }
        "available_commands" | "current_mode_update" | "config_options" => {
            passthrough(kind, update)
        }
        other => passthrough(other, update),
    }
}

fn passthrough(kind: &str, update: &Value) -> Value {
    let mut object = update.as_object().cloned().unwrap_or_default();
    object.remove("sessionUpdate");
    object.insert("kind".to_string(), json!(kind));
    Value::Object(object)
}

/// Extract the client-facing prompt result from the final turn params
/// (direct or synthesized by the correlator).
pub fn translate_prompt_result(params: &Value) -> PromptResult {
    let content = params
        .get("content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();
    let stop_reason = StopReason::normalize(params.get("stopReason").and_then(|s| s.as_str()));
    PromptResult {
        content,
        stop_reason,
    }
}
