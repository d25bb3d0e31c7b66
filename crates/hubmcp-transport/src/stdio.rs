//! Stdio Transport (C3): owns one child process for the lifetime of its
//! Session, framing JSON-RPC as newline-delimited JSON over stdin/stdout.
//!
//! Grounded on the teacher's `child_process.rs` process-lifecycle shape:
//! spawn with piped stdio, a dedicated reader task, a mutex-guarded stdin
//! writer, and a bounded stderr ring buffer for diagnostics. The MCP
//! handshake (`initialize`/`initialized`) and the shutdown escalation
//! (`shutdown`/`exit` -> SIGTERM -> SIGKILL) are this build's addition over
//! that shape, since the teacher's transport did not speak MCP itself.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use hubmcp_protocol::jsonrpc::{JsonRpcRequest, JsonRpcVersion, RequestId};
use hubmcp_protocol::JsonRpcMessage;

use crate::core::{
    StateCell, TransportError, TransportKind, TransportState, DRAIN_GRACE_MS, DRAIN_KILL_MS,
};
use crate::transport::Transport;

const STDERR_RING_CAPACITY: usize = 64;

/// Construction parameters for a stdio backend, taken verbatim from a
/// decrypted `BackendServer` row.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub max_frame_bytes: usize,
}

pub struct StdioTransport {
    state: Arc<StateCell>,
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    frames_rx: Mutex<mpsc::Receiver<Result<JsonRpcMessage, TransportError>>>,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
    next_handshake_id: std::sync::atomic::AtomicI64,
}

impl StdioTransport {
    /// Spawn the child process and start its reader/stderr-drain tasks.
    /// Returns a transport in state `Initializing`; callers must still call
    /// [`Transport::initialize`] before routing traffic.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if the process cannot be started.
    pub async fn spawn(config: StdioConfig) -> Result<Self, TransportError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(TransportError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("child stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("child stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Connect("child stderr not piped".into()))?;

        let state = Arc::new(StateCell::new(TransportState::Initializing));
        let (frames_tx, frames_rx) = mpsc::channel(256);
        let stderr_ring = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));

        spawn_stdout_reader(
            stdout,
            frames_tx,
            Arc::clone(&state),
            config.max_frame_bytes,
        );
        spawn_stderr_drain(stderr, Arc::clone(&stderr_ring));

        Ok(Self {
            state,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            frames_rx: Mutex::new(frames_rx),
            stderr_ring,
            next_handshake_id: std::sync::atomic::AtomicI64::new(1),
        })
    }

    /// Last few lines captured from the child's stderr, for diagnostics when
    /// a session dies.
    pub async fn recent_stderr(&self) -> Vec<String> {
        self.stderr_ring.lock().await.iter().cloned().collect()
    }

    async fn write_line(&self, msg: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut line = hubmcp_protocol::serialize_message(msg).map_err(TransportError::Decode)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::Write)?;
        stdin.flush().await.map_err(TransportError::Write)
    }
}

fn spawn_stdout_reader(
    stdout: tokio::process::ChildStdout,
    tx: mpsc::Sender<Result<JsonRpcMessage, TransportError>>,
    state: Arc<StateCell>,
    max_frame_bytes: usize,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    if state.mark_dead() {
                        debug!("stdio transport saw EOF on stdout");
                    }
                    let _ = tx.send(Err(TransportError::Eof)).await;
                    return;
                }
                Ok(n) => {
                    if n > max_frame_bytes {
                        state.mark_dead();
                        let _ = tx
                            .send(Err(TransportError::FrameTooLarge {
                                limit: max_frame_bytes,
                            }))
                            .await;
                        return;
                    }
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    match hubmcp_protocol::parse_message(trimmed) {
                        Ok(msg) => {
                            if tx.send(Ok(msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            state.mark_dead();
                            let _ = tx.send(Err(TransportError::Decode(e))).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    state.mark_dead();
                    let _ = tx.send(Err(TransportError::Write(e))).await;
                    return;
                }
            }
        }
    });
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, ring: Arc<Mutex<VecDeque<String>>>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {
                    let mut ring = ring.lock().await;
                    if ring.len() == STDERR_RING_CAPACITY {
                        ring.pop_front();
                    }
                    ring.push_back(line.trim_end().to_string());
                }
            }
        }
    });
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_frame(&self, msg: &JsonRpcMessage) -> Result<(), TransportError> {
        match self.state.get() {
            TransportState::Draining | TransportState::Dead => return Err(TransportError::NotReady),
            _ => {}
        }
        self.write_line(msg).await
    }

    async fn recv_frame(&self) -> Result<Option<JsonRpcMessage>, TransportError> {
        let mut rx = self.frames_rx.lock().await;
        match rx.recv().await {
            None => Ok(None),
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(TransportError::Eof)) => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }

    async fn initialize(
        &self,
        client_info: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let id = RequestId::Number(
            self.next_handshake_id
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        );
        let request = JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: id.clone(),
            method: "initialize".to_string(),
            params: Some(client_info),
        });

        self.write_line(&request).await?;

        let result = tokio::time::timeout(timeout, self.await_handshake_response(&id)).await;
        let capabilities = match result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                self.state.mark_dead();
                return Err(e);
            }
            Err(_) => {
                self.state.mark_dead();
                return Err(TransportError::HandshakeTimeout);
            }
        };

        let initialized = JsonRpcMessage::Notification(hubmcp_protocol::JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method: "notifications/initialized".to_string(),
            params: None,
        });
        self.write_line(&initialized).await?;

        self.state.set(TransportState::Ready);
        Ok(capabilities)
    }

    async fn drain(&self) {
        if !matches!(self.state.get(), TransportState::Dead) {
            self.state.set(TransportState::Draining);
        }

        let shutdown = JsonRpcMessage::Notification(hubmcp_protocol::JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method: "shutdown".to_string(),
            params: None,
        });
        let exit = JsonRpcMessage::Notification(hubmcp_protocol::JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method: "exit".to_string(),
            params: None,
        });
        let _ = self.write_line(&shutdown).await;
        let _ = self.write_line(&exit).await;

        let mut child = self.child.lock().await;
        let grace = Duration::from_millis(DRAIN_GRACE_MS);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            self.state.mark_dead();
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process id obtained from the still-live Child handle.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        let kill_grace = Duration::from_millis(DRAIN_KILL_MS);
        if tokio::time::timeout(kill_grace, child.wait()).await.is_ok() {
            self.state.mark_dead();
            return;
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to force-kill stdio backend during drain");
        }
        self.state.mark_dead();
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

impl StdioTransport {
    async fn await_handshake_response(
        &self,
        expected_id: &RequestId,
    ) -> Result<serde_json::Value, TransportError> {
        loop {
            let mut rx = self.frames_rx.lock().await;
            match rx.recv().await {
                None => return Err(TransportError::Eof),
                Some(Err(TransportError::Eof)) => return Err(TransportError::Eof),
                Some(Err(e)) => return Err(e),
                Some(Ok(JsonRpcMessage::Response(response))) if &response.id == expected_id => {
                    return if response.is_error() {
                        let err = response.into_error().expect("checked is_error above");
                        Err(TransportError::HandshakeRejected(err.message))
                    } else {
                        Ok(response.result().cloned().unwrap_or(serde_json::Value::Null))
                    }
                }
                Some(Ok(_)) => {
                    // Stray traffic before handshake completion: not expected in
                    // practice since the manager holds the key until Ready, but
                    // harmless to drop rather than block forever.
                    continue;
                }
            }
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.state.mark_dead();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config(command: &str, args: &[&str]) -> StdioConfig {
        StdioConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            max_frame_bytes: crate::core::DEFAULT_MAX_FRAME_BYTES,
        }
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_command() {
        let config = default_config("definitely-not-a-real-binary-xyz", &[]);
        let result = StdioTransport::spawn(config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn echoes_a_jsonrpc_line_back() {
        // `cat` echoes stdin to stdout unmodified, which is enough to drive
        // one newline-delimited JSON round trip without a real MCP server.
        let config = default_config("cat", &[]);
        let Ok(transport) = StdioTransport::spawn(config).await else {
            return; // environment without `cat`; skip rather than fail the suite
        };

        let msg = JsonRpcMessage::Notification(hubmcp_protocol::JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method: "ping".to_string(),
            params: None,
        });
        transport.send_frame(&msg).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), transport.recv_frame())
            .await
            .expect("did not time out")
            .expect("no transport error");
        assert_eq!(received.and_then(|m| m.method().map(str::to_string)), Some("ping".to_string()));
    }
}
