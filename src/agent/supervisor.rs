// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Subprocess supervisor: owns one agent child process per session.
//!
//! Each child speaks newline-delimited JSON-RPC on stdout/stdin. The stdout
//! reader resolves the owning session id through a shared cell at
//! line-arrival time, so a mid-handshake session rename is observed by the
//! very next line without restarting the reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::stderr::{classify, StderrKind};

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Bare name of the agent binary when no override is configured.
const AGENT_BINARY: &str = "opencode";

/// Fixed probe list for agent binary discovery.
const AGENT_PATH_CANDIDATES: &[&str] = &[
    "/usr/local/bin/opencode",
    "/opt/homebrew/bin/opencode",
    "/usr/bin/opencode",
];

/// Supervisor error types
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("agent process pipe unavailable: {0}")]
    Pipe(&'static str),

    #[error("no agent process for session {0}")]
    ProcessNotFound(String),

    #[error("agent stdin write failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("agent message serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Resolved launch command for the agent binary.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// Resolve the launch command. An explicit override (whitespace-separated
    /// binary + args) replaces both the binary probe and the base arguments;
    /// otherwise the fixed path list is probed, falling back to PATH, and the
    /// standard `acp --print-logs` arguments are used.
    pub fn resolve(override_cmd: Option<&str>) -> Self {
        if let Some(cmd) = override_cmd {
            let mut parts = cmd.split_whitespace();
            if let Some(program) = parts.next() {
                return Self {
                    program: PathBuf::from(program),
                    args: parts.map(str::to_string).collect(),
                };
            }
        }

        Self {
            program: discover_binary(),
            args: vec!["acp".to_string(), "--print-logs".to_string()],
        }
    }
}

fn discover_binary() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let candidate = Path::new(&home).join(".opencode").join("bin").join(AGENT_BINARY);
        if candidate.exists() {
            return candidate;
        }
    }
    for candidate in AGENT_PATH_CANDIDATES {
        let path = Path::new(candidate);
        if path.exists() {
            return path.to_path_buf();
        }
    }
    which::which(AGENT_BINARY).unwrap_or_else(|_| PathBuf::from(AGENT_BINARY))
}

/// Parameters for spawning a session's subprocess.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub session_id: String,
    pub cwd: Option<String>,
    pub model: Option<String>,
}

/// Per-session callback slots, set at registration time by the dispatcher.
/// The supervisor holds no back-pointer to the dispatcher.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub on_message: Arc<dyn Fn(&str, Value) + Send + Sync>,
    pub on_stderr: Arc<dyn Fn(&str, StderrKind, &str) + Send + Sync>,
    pub on_close: Arc<dyn Fn(&str, Option<i32>) + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Initializing,
    Ready,
    Error,
    Closed,
}

struct ProcessHandle {
    /// Shared with the reader tasks; mutated exactly once by migration.
    session_id: Arc<Mutex<String>>,
    pid: u32,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    closed: watch::Receiver<bool>,
    status: Arc<Mutex<ProcessStatus>>,
}

type ProcessTable = Arc<Mutex<HashMap<String, ProcessHandle>>>;
type CallbackTable = Arc<Mutex<HashMap<String, SessionCallbacks>>>;

/// Owns the agent child processes, keyed by session id.
pub struct AgentSupervisor {
    command: AgentCommand,
    processes: ProcessTable,
    callbacks: CallbackTable,
}

impl AgentSupervisor {
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            processes: Arc::new(Mutex::new(HashMap::new())),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a subprocess for a session and register its callback slots.
    pub fn spawn(&self, spec: SpawnSpec, callbacks: SessionCallbacks) -> Result<(), AgentError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        if let Some(cwd) = &spec.cwd {
            cmd.arg("--cwd").arg(cwd);
        }
        if let Some(model) = &spec.model {
            cmd.arg("--model").arg(model);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(AgentError::Spawn)?;
        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take().ok_or(AgentError::Pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(AgentError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(AgentError::Pipe("stderr"))?;

        let session_cell = Arc::new(Mutex::new(spec.session_id.clone()));
        let (closed_tx, closed_rx) = watch::channel(false);
        let status = Arc::new(Mutex::new(ProcessStatus::Initializing));

        self.callbacks.lock().insert(spec.session_id.clone(), callbacks);
        self.processes.lock().insert(
            spec.session_id.clone(),
            ProcessHandle {
                session_id: session_cell.clone(),
                pid,
                stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                closed: closed_rx,
                status,
            },
        );

        tokio::spawn(stdout_loop(session_cell.clone(), self.callbacks.clone(), stdout));
        tokio::spawn(stderr_loop(session_cell.clone(), self.callbacks.clone(), stderr));
        tokio::spawn(waiter(
            child,
            session_cell,
            self.processes.clone(),
            self.callbacks.clone(),
            closed_tx,
        ));

        debug!(session_id = %spec.session_id, pid, "spawned agent process");
        Ok(())
    }

    /// Serialize `message` and write it as one line to the session's stdin.
    /// A closed or absent process is a hard error to the caller.
    pub async fn send(&self, session_id: &str, message: &Value) -> Result<(), AgentError> {
        let stdin = self
            .processes
            .lock()
            .get(session_id)
            .map(|handle| handle.stdin.clone())
            .ok_or_else(|| AgentError::ProcessNotFound(session_id.to_string()))?;

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut guard = stdin.lock().await;
        guard.write_all(&line).await.map_err(AgentError::Io)?;
        guard.flush().await.map_err(AgentError::Io)?;
        Ok(())
    }

    /// Re-key the process and callback tables from `old` to `new` and flip
    /// the shared session-id cell. The stdout reader samples the cell and the
    /// callback table under the same lock, so it observes either the old pair
    /// or the new pair, never a mixture.
    pub fn migrate(&self, old: &str, new: &str) -> Result<(), AgentError> {
        let mut callbacks = self.callbacks.lock();
        let mut processes = self.processes.lock();
        let handle = processes
            .remove(old)
            .ok_or_else(|| AgentError::ProcessNotFound(old.to_string()))?;
        *handle.session_id.lock() = new.to_string();
        if let Some(cb) = callbacks.remove(old) {
            callbacks.insert(new.to_string(), cb);
        }
        processes.insert(new.to_string(), handle);
        Ok(())
    }

    /// Replace the callback slots registered for a session.
    pub fn set_callbacks(&self, session_id: &str, callbacks: SessionCallbacks) {
        self.callbacks.lock().insert(session_id.to_string(), callbacks);
    }

    pub fn set_status(&self, session_id: &str, status: ProcessStatus) {
        if let Some(handle) = self.processes.lock().get(session_id) {
            *handle.status.lock() = status;
        }
    }

    pub fn status(&self, session_id: &str) -> Option<ProcessStatus> {
        self.processes.lock().get(session_id).map(|h| *h.status.lock())
    }

    pub fn has_process(&self, session_id: &str) -> bool {
        self.processes.lock().contains_key(session_id)
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Kill the session's subprocess: SIGTERM, up to [`KILL_GRACE`], then
    /// SIGKILL. Resolves once the waiter has reaped the child. Absent
    /// processes are a no-op.
    pub async fn kill(&self, session_id: &str) -> Result<(), AgentError> {
        let (pid, mut closed) = match self.processes.lock().get(session_id) {
            Some(handle) => {
                *handle.status.lock() = ProcessStatus::Closed;
                (handle.pid, handle.closed.clone())
            }
            None => return Ok(()),
        };

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let graceful_failed =
            tokio::time::timeout(KILL_GRACE, closed.wait_for(|c| *c)).await.is_err();
        if graceful_failed {
            warn!(session_id, pid, "agent ignored SIGTERM; sending SIGKILL");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
            let _ = closed.wait_for(|c| *c).await;
        }
        Ok(())
    }
}

async fn stdout_loop(
    session_cell: Arc<Mutex<String>>,
    callbacks: CallbackTable,
    stdout: ChildStdout,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(message) => {
                // Sample the cell and the slot under one lock so a migration
                // never yields a stale (id, callback) pair.
                let target = {
                    let table = callbacks.lock();
                    let session_id = session_cell.lock().clone();
                    table.get(&session_id).map(|cb| (session_id, cb.on_message.clone()))
                };
                match target {
                    Some((session_id, on_message)) => on_message(&session_id, message),
                    None => debug!("agent stdout line arrived for unregistered session"),
                }
            }
            Err(err) => {
                debug!(error = %err, "dropping non-JSON agent stdout line");
            }
        }
    }
}

async fn stderr_loop(
    session_cell: Arc<Mutex<String>>,
    callbacks: CallbackTable,
    stderr: ChildStderr,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "agent", "stderr: {}", line);
        if let Some(kind) = classify(&line) {
            warn!(?kind, "agent stderr matched error pattern");
            let target = {
                let table = callbacks.lock();
                let session_id = session_cell.lock().clone();
                table.get(&session_id).map(|cb| (session_id, cb.on_stderr.clone()))
            };
            if let Some((session_id, on_stderr)) = target {
                on_stderr(&session_id, kind, &line);
            }
        }
    }
}

async fn waiter(
    mut child: Child,
    session_cell: Arc<Mutex<String>>,
    processes: ProcessTable,
    callbacks: CallbackTable,
    closed_tx: watch::Sender<bool>,
) {
    let status = child.wait().await.ok();
    let code = status.as_ref().and_then(|s| s.code());
    let session_id = session_cell.lock().clone();
    let callback = callbacks.lock().remove(&session_id);
    processes.lock().remove(&session_id);
    let _ = closed_tx.send(true);
    debug!(session_id = %session_id, ?code, "agent process exited");
    if let Some(cb) = callback {
        (cb.on_close)(&session_id, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;

    fn echo_command() -> AgentCommand {
        AgentCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                "while IFS= read -r line; do printf '%s\\n' \"$line\"; done".to_string(),
            ],
        }
    }

    fn callbacks_with_channel(
        tx: mpsc::Sender<(String, Value)>,
        close_tx: mpsc::Sender<Option<i32>>,
    ) -> SessionCallbacks {
        SessionCallbacks {
            on_message: Arc::new(move |sid, value| {
                let _ = tx.send((sid.to_string(), value));
            }),
            on_stderr: Arc::new(|_, _, _| {}),
            on_close: Arc::new(move |_, code| {
                let _ = close_tx.send(code);
            }),
        }
    }

    #[test]
    fn resolve_override_splits_binary_and_args() {
        let cmd = AgentCommand::resolve(Some("/usr/bin/mock-agent --flag value"));
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/mock-agent"));
        assert_eq!(cmd.args, vec!["--flag", "value"]);
    }

    #[test]
    fn resolve_default_uses_acp_arguments() {
        let cmd = AgentCommand::resolve(None);
        assert_eq!(cmd.args, vec!["acp", "--print-logs"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn round_trip_and_migration_route_to_current_id() {
        let supervisor = AgentSupervisor::new(echo_command());
        let (tx, rx) = mpsc::channel();
        let (close_tx, _close_rx) = mpsc::channel();
        supervisor
            .spawn(
                SpawnSpec {
                    session_id: "tentative".to_string(),
                    cwd: None,
                    model: None,
                },
                callbacks_with_channel(tx, close_tx),
            )
            .expect("spawn");

        supervisor
            .send("tentative", &json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
            .await
            .expect("send");
        let (sid, msg) = rx.recv_timeout(Duration::from_secs(5)).expect("echo");
        assert_eq!(sid, "tentative");
        assert_eq!(msg["id"], 1);

        supervisor.migrate("tentative", "renamed").expect("migrate");
        assert!(!supervisor.has_process("tentative"));
        assert!(supervisor.has_process("renamed"));

        supervisor
            .send("renamed", &json!({"jsonrpc": "2.0", "id": 2, "result": {}}))
            .await
            .expect("send after migration");
        let (sid, msg) = rx.recv_timeout(Duration::from_secs(5)).expect("echo");
        assert_eq!(sid, "renamed");
        assert_eq!(msg["id"], 2);

        supervisor.kill("renamed").await.expect("kill");
        assert_eq!(supervisor.process_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_json_lines_are_dropped() {
        let supervisor = AgentSupervisor::new(AgentCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                "printf 'not json\\n{\"id\":7,\"result\":{}}\\n'; sleep 5".to_string(),
            ],
        });
        let (tx, rx) = mpsc::channel();
        let (close_tx, _close_rx) = mpsc::channel();
        supervisor
            .spawn(
                SpawnSpec {
                    session_id: "s".to_string(),
                    cwd: None,
                    model: None,
                },
                callbacks_with_channel(tx, close_tx),
            )
            .expect("spawn");

        // The invalid neighbor is skipped; the valid line still arrives.
        let (_, msg) = rx.recv_timeout(Duration::from_secs(5)).expect("valid line");
        assert_eq!(msg["id"], 7);

        supervisor.kill("s").await.expect("kill");
    }

    #[tokio::test]
    async fn kill_reaps_and_fires_on_close() {
        let supervisor = AgentSupervisor::new(AgentCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "sleep 60".to_string()],
        });
        let (tx, _rx) = mpsc::channel();
        let (close_tx, close_rx) = mpsc::channel();
        supervisor
            .spawn(
                SpawnSpec {
                    session_id: "victim".to_string(),
                    cwd: None,
                    model: None,
                },
                callbacks_with_channel(tx, close_tx),
            )
            .expect("spawn");
        assert_eq!(supervisor.process_count(), 1);

        supervisor.kill("victim").await.expect("kill");
        assert_eq!(supervisor.process_count(), 0);
        // SIGTERM exit carries no code.
        let code = close_rx.recv_timeout(Duration::from_secs(5)).expect("on_close");
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn send_to_absent_process_is_an_error() {
        let supervisor = AgentSupervisor::new(echo_command());
        let err = supervisor.send("ghost", &json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ProcessNotFound(_)));
    }
}
