// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scripted stdio agent used by the integration tests.
//!
//! Speaks the bridge's agent pipe dialect: newline-delimited JSON-RPC 2.0 on
//! stdin/stdout. Prompt text selects the scripted behavior:
//!
//! - default: two `agent_message_chunk` updates, then an `end_turn` result
//! - `thought`: a thought chunk before the message chunks
//! - `slow`: one chunk, then wait for `session/cancel` and finish with
//!   `stopReason = cancelled`
//! - `use-tool`: a `session/request_permission` round trip (options omitted
//!   to exercise default injection), then tool-call updates
//! - `stderr-rate-limit`: a rate-limit line on stderr before finishing

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Parser)]
struct Args {
    /// Ignored subcommand slot (`acp`) for launch-compatibility
    #[arg()]
    subcommand: Option<String>,

    /// Accepted and ignored
    #[arg(long)]
    print_logs: bool,

    /// Working directory to advertise
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Model to advertise
    #[arg(long)]
    model: Option<String>,
}

struct AgentState {
    session_id: Mutex<Option<String>>,
    model: Mutex<String>,
    /// Cancel slot for the active turn.
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    /// Permission requests awaiting a bridge response, keyed by JSON-RPC id.
    pending: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    next_id: Mutex<i64>,
}

fn emit(value: Value) {
    // Stdout is line-buffered; one JSON object per line.
    println!("{value}");
}

fn respond(id: &Value, result: Value) {
    emit(json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn notify_update(session_id: &str, update: Value) {
    emit(json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {"sessionId": session_id, "update": update},
    }));
}

fn message_chunk(text: &str) -> Value {
    json!({
        "sessionUpdate": "agent_message_chunk",
        "content": {"type": "text", "text": text},
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if let Some(cwd) = &args.cwd {
        std::env::set_current_dir(cwd).ok();
    }
    if args.print_logs {
        eprintln!(
            "mock-agent starting ({} mode)",
            args.subcommand.as_deref().unwrap_or("acp")
        );
    }
    let state = Arc::new(AgentState {
        session_id: Mutex::new(None),
        model: Mutex::new(args.model.unwrap_or_else(|| "mock-1".to_string())),
        cancel: Mutex::new(None),
        pending: Mutex::new(HashMap::new()),
        next_id: Mutex::new(9000),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        handle_message(&state, message);
    }
    Ok(())
}

fn handle_message(state: &Arc<AgentState>, message: Value) {
    let id = message.get("id").cloned().filter(|v| !v.is_null());
    let method = message.get("method").and_then(|m| m.as_str());
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    match (method, id) {
        (Some("initialize"), Some(id)) => {
            respond(
                &id,
                json!({
                    "protocolVersion": 1,
                    "authMethods": [{"id": "api-key", "name": "API Key"}],
                    "agentCapabilities": {},
                }),
            );
        }
        (Some("session/new"), Some(id)) => {
            let session_id = format!("sess-{}", Uuid::new_v4());
            *state.session_id.lock() = Some(session_id.clone());
            if let Some(model) = params.get("model").and_then(|m| m.as_str()) {
                *state.model.lock() = model.to_string();
            }
            let model = state.model.lock().clone();
            respond(
                &id,
                json!({
                    "sessionId": session_id,
                    "models": ["mock-1", "mock-2"],
                    "model": model,
                    "modes": {
                        "currentModeId": "build",
                        "availableModes": [
                            {"id": "ask", "name": "Ask"},
                            {"id": "build", "name": "Build"},
                        ],
                    },
                }),
            );
        }
        (Some("session/prompt"), Some(id)) => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                run_turn(state, id, params).await;
            });
        }
        (Some("session/cancel"), _) => {
            if let Some(cancel) = state.cancel.lock().take() {
                let _ = cancel.send(());
            }
        }
        (Some(_), Some(id)) => {
            emit(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "method not found"},
            }));
        }
        // Response from the bridge to one of our requests.
        (None, Some(id)) => {
            if let Some(n) = id.as_i64() {
                if let Some(waiter) = state.pending.lock().remove(&n) {
                    let _ = waiter.send(message.get("result").cloned().unwrap_or(Value::Null));
                }
            }
        }
        _ => {}
    }
}

async fn run_turn(state: Arc<AgentState>, prompt_id: Value, params: Value) {
    let session_id = state
        .session_id
        .lock()
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let text = params
        .pointer("/prompt/0/text")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();

    if text.contains("stderr-rate-limit") {
        eprintln!("Rate limit exceeded at upstream provider (retry after 30s)");
        respond(&prompt_id, json!({"content": [], "stopReason": "end_turn"}));
        return;
    }

    if text.contains("slow") {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *state.cancel.lock() = Some(cancel_tx);
        notify_update(&session_id, message_chunk("working on it"));
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_secs(10), cancel_rx).await.is_ok();
        let stop_reason = if cancelled { "cancelled" } else { "end_turn" };
        respond(
            &prompt_id,
            json!({"content": [], "stopReason": stop_reason}),
        );
        return;
    }

    if text.contains("use-tool") {
        let request_id = {
            let mut next = state.next_id.lock();
            *next += 1;
            *next
        };
        let (tx, rx) = oneshot::channel();
        state.pending.lock().insert(request_id, tx);
        // Options deliberately omitted: the bridge injects its defaults.
        emit(json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "session/request_permission",
            "params": {
                "sessionId": session_id,
                "toolCall": {"toolCallId": "tool-1", "toolName": "write_file"},
            },
        }));
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(10), rx)
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or(Value::Null);
        let allowed = outcome.pointer("/outcome/outcome").and_then(|o| o.as_str())
            == Some("selected");

        if allowed {
            notify_update(
                &session_id,
                json!({
                    "sessionUpdate": "tool_call",
                    "toolCallId": "tool-1",
                    "toolName": "write_file",
                    "arguments": {"path": "README.md"},
                    "status": "pending",
                }),
            );
            notify_update(
                &session_id,
                json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": "tool-1",
                    "status": "completed",
                    "content": [{"type": "text", "text": "wrote README.md"}],
                }),
            );
            respond(
                &prompt_id,
                json!({
                    "content": [{"type": "text", "text": "tool finished"}],
                    "stopReason": "end_turn",
                }),
            );
        } else {
            respond(&prompt_id, json!({"content": [], "stopReason": "cancelled"}));
        }
        return;
    }

    if text.contains("thought") {
        notify_update(
            &session_id,
            json!({
                "sessionUpdate": "agent_thought_chunk",
                "content": {"type": "text", "text": "thinking it over"},
            }),
        );
    }

    notify_update(&session_id, message_chunk("Hel"));
    notify_update(&session_id, message_chunk("lo"));
    respond(
        &prompt_id,
        json!({
            "content": [{"type": "text", "text": "hello"}],
            "stopReason": "end_turn",
        }),
    );
}
