//! Backend session — owns one backend child process and its MCP handshake.
//!
//! Spawns the child, drains its stderr into a bounded ring buffer, and
//! multiplexes its stdout back to callers through a per-session pending-request
//! table (a `HashMap<u64, oneshot::Sender<_>>` guarded by a mutex, fed by a
//! dedicated writer task and drained by a single reader task).

use crate::codec::{self, Frame, ReadOutcome};
use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const STDERR_BUFFER_CAPACITY: usize = 200;

/// Lifecycle state of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Ready,
    Terminating,
    Terminated,
    Failed,
}

/// A bounded rolling buffer of a child's stderr lines, for diagnostics.
#[derive(Debug, Default)]
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    fn new(capacity: usize) -> Self {
        StderrBuffer {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

struct PendingEntry {
    tx: oneshot::Sender<std::result::Result<Value, FrameError>>,
}

/// A JSON-RPC error as delivered to a waiting caller.
#[derive(Debug, Clone)]
pub struct FrameError {
    pub code: i64,
    pub message: String,
}

/// A single outstanding outbound write, queued onto the session's writer task.
struct OutboundWrite {
    frame: Frame,
}

/// One supervised backend MCP server.
pub struct BackendSession {
    name: String,
    config: BackendConfig,
    state: Arc<RwLock<SessionState>>,
    pending: Arc<Mutex<HashMap<u64, PendingEntry>>>,
    next_id: AtomicU64,
    outbound_tx: Mutex<Option<mpsc::Sender<OutboundWrite>>>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    stderr_buffer: Arc<Mutex<StderrBuffer>>,
    tools_cache: Arc<RwLock<Option<Value>>>,
    started_at: Instant,
}

impl BackendSession {
    /// Construct a session in the `NotStarted` state. Does not spawn anything.
    pub fn new(name: impl Into<String>, config: BackendConfig, cancel: CancellationToken) -> Self {
        BackendSession {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(SessionState::NotStarted)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            outbound_tx: Mutex::new(None),
            child: Mutex::new(None),
            cancel,
            stderr_buffer: Arc::new(Mutex::new(StderrBuffer::new(STDERR_BUFFER_CAPACITY))),
            tools_cache: Arc::new(RwLock::new(None)),
            started_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone the backend's configuration, for recreating a fresh session
    /// after this one transitions to `Failed` or `Terminated`.
    pub fn config_snapshot(&self) -> BackendConfig {
        self.config.clone()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    /// Spawn the child process and run the MCP `initialize` handshake.
    ///
    /// On success the session is left in `Ready` with its reader/writer/stderr
    /// tasks running in the background. On failure the session is left in
    /// `Failed` and the error is returned to the caller that triggered the
    /// spawn; the registry is responsible for creating a fresh instance on
    /// the next call.
    pub async fn start(&self) -> Result<()> {
        self.set_state(SessionState::Starting).await;
        match self.spawn_and_handshake().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(SessionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn spawn_and_handshake(&self) -> Result<()> {
        let resolved_env = crate::config::resolve_env_vars(&self.config.env);
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(resolved_env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            GatewayError::InitializationFailed(self.name.clone(), e.to_string())
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::InitializationFailed(self.name.clone(), "no stdin pipe".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::InitializationFailed(self.name.clone(), "no stdout pipe".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            GatewayError::InitializationFailed(self.name.clone(), "no stderr pipe".to_string())
        })?;

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundWrite>(64);
        *self.outbound_tx.lock().await = Some(outbound_tx);
        *self.child.lock().await = Some(child);

        spawn_writer_task(stdin, outbound_rx, self.name.clone());
        spawn_stdout_reader(
            BufReader::new(stdout),
            self.pending.clone(),
            self.name.clone(),
            self.cancel.clone(),
        );
        spawn_stderr_drain(stderr, self.stderr_buffer.clone(), self.name.clone(), self.cancel.clone());

        let handshake_timeout = self.config.timeout();
        match tokio::time::timeout(handshake_timeout, self.handshake()).await {
            Ok(Ok(())) => {
                self.set_state(SessionState::Ready).await;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::InitializationFailed(
                self.name.clone(),
                "handshake timed out".to_string(),
            )),
        }
    }

    async fn handshake(&self) -> Result<()> {
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "gatemux", "version": env!("CARGO_PKG_VERSION") },
        });
        self.call_raw("initialize", Some(params), self.config.timeout())
            .await?;
        self.notify("notifications/initialized", None).await?;
        Ok(())
    }

    /// Issue a notification (no response expected) to the backend.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = Frame::notification(method, params);
        let guard = self.outbound_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| GatewayError::Transport(self.name.clone(), "not started".to_string()))?;
        tx.send(OutboundWrite { frame })
            .await
            .map_err(|_| GatewayError::Transport(self.name.clone(), "writer closed".to_string()))
    }

    /// Issue a request and await its matching response, or a timeout/abort.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let state = self.state().await;
        if matches!(state, SessionState::Terminating | SessionState::Terminated | SessionState::Failed) {
            return Err(GatewayError::BackendUnavailable(
                self.name.clone(),
                format!("session is {:?}", state),
            ));
        }
        self.call_raw(method, params, timeout).await
    }

    async fn call_raw(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, PendingEntry { tx });

        let frame = Frame::request(Value::from(id), method, params);
        {
            let guard = self.outbound_tx.lock().await;
            let outbound = guard.as_ref().ok_or_else(|| {
                GatewayError::Transport(self.name.clone(), "not started".to_string())
            })?;
            if outbound.send(OutboundWrite { frame }).await.is_err() {
                self.pending.lock().await.remove(&id);
                return Err(GatewayError::Transport(
                    self.name.clone(),
                    "writer closed".to_string(),
                ));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(frame_error))) => Err(GatewayError::Protocol(
                self.name.clone(),
                frame_error.message,
            )),
            Ok(Err(_)) => {
                // sender dropped without a reply — session is tearing down.
                Err(GatewayError::Aborted(
                    self.name.clone(),
                    "session closed while awaiting response".to_string(),
                ))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::CallTimeout(self.name.clone()))
            }
        }
    }

    /// Return the cached `tools/list` result, fetching and caching it on
    /// first access. Subsequent calls return the cached value verbatim.
    pub async fn tools_list(&self) -> Result<Value> {
        if let Some(cached) = self.tools_cache.read().await.clone() {
            return Ok(cached);
        }
        let result = self.call("tools/list", None, self.config.timeout()).await?;
        *self.tools_cache.write().await = Some(result.clone());
        Ok(result)
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        // best-effort snapshot; lock is uncontended in the common case.
        self.stderr_buffer
            .try_lock()
            .map(|buf| buf.lines())
            .unwrap_or_default()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Terminate the child: close stdin, wait a grace period, then kill.
    ///
    /// Every outstanding waiter is completed with an aborted error.
    pub async fn terminate(&self) {
        self.set_state(SessionState::Terminating).await;
        *self.outbound_tx.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            if let Some(stdin) = child.stdin.as_mut() {
                let _ = stdin.shutdown().await;
            }
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(FrameError {
                code: codec::INTERNAL_ERROR,
                message: "session terminated".to_string(),
            }));
        }
        self.set_state(SessionState::Terminated).await;
    }
}

fn spawn_writer_task(
    mut stdin: tokio::process::ChildStdin,
    mut outbound_rx: mpsc::Receiver<OutboundWrite>,
    backend: String,
) {
    tokio::spawn(async move {
        while let Some(write) = outbound_rx.recv().await {
            if let Err(e) = codec::write_frame(&mut stdin, &write.frame).await {
                tracing::warn!(backend = %backend, error = %e, "failed to write frame to backend stdin");
                break;
            }
        }
    });
}

fn spawn_stdout_reader(
    mut reader: BufReader<tokio::process::ChildStdout>,
    pending: Arc<Mutex<HashMap<u64, PendingEntry>>>,
    backend: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = codec::read_frame(&mut reader) => {
                    match outcome {
                        Ok(ReadOutcome::Frame(frame)) => dispatch_frame(frame, &pending, &backend).await,
                        Ok(ReadOutcome::ParseError { raw, .. }) => {
                            tracing::debug!(backend = %backend, line = %raw, "discarding non-JSON-RPC line from backend stdout");
                        }
                        Ok(ReadOutcome::Eof) => {
                            tracing::warn!(backend = %backend, "backend stdout closed");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(backend = %backend, error = %e, "error reading backend stdout");
                            break;
                        }
                    }
                }
            }
        }
        // drain the pending table so no caller waits forever past EOF.
        let mut pending = pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(FrameError {
                code: codec::INTERNAL_ERROR,
                message: "backend stdout closed".to_string(),
            }));
        }
    });
}

async fn dispatch_frame(frame: Frame, pending: &Arc<Mutex<HashMap<u64, PendingEntry>>>, backend: &str) {
    if frame.is_response() {
        let id = match frame.id.as_ref().and_then(Value::as_u64) {
            Some(id) => id,
            None => {
                tracing::debug!(backend = %backend, "response frame with non-numeric id");
                return;
            }
        };
        let entry = pending.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                let payload = if let Some(err) = frame.error {
                    Err(FrameError {
                        code: err.code,
                        message: err.message,
                    })
                } else {
                    Ok(frame.result.unwrap_or(Value::Null))
                };
                let _ = entry.tx.send(payload);
            }
            None => tracing::debug!(backend = %backend, id, "response for unknown pending id"),
        }
    } else if frame.is_notification() {
        tracing::debug!(backend = %backend, method = ?frame.method, "notification from backend (not forwarded upstream)");
    } else if frame.is_request() {
        // server-initiated requests from a backend are not supported.
        tracing::warn!(backend = %backend, method = ?frame.method, "backend issued a request; unsupported");
    }
}

fn spawn_stderr_drain(
    stderr: tokio::process::ChildStderr,
    buffer: Arc<Mutex<StderrBuffer>>,
    backend: String,
    cancel: CancellationToken,
) {
    use tokio::io::AsyncBufReadExt;
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::debug!(backend = %backend, line = %line, "backend stderr");
                            buffer.lock().await.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(backend = %backend, error = %e, "error reading backend stderr");
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_config() -> BackendConfig {
        toml::from_str(
            r#"
            command = "cat"
            timeout_secs = 2
            "#,
        )
        .expect("valid config")
    }

    #[test]
    fn test_initial_state_is_not_started() {
        let session = BackendSession::new("echo", echo_config(), CancellationToken::new());
        assert_eq!(
            futures::executor::block_on(session.state()),
            SessionState::NotStarted
        );
    }

    #[test]
    fn test_stderr_buffer_capacity() {
        let mut buffer = StderrBuffer::new(2);
        buffer.push("a".to_string());
        buffer.push("b".to_string());
        buffer.push("c".to_string());
        assert_eq!(buffer.lines(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let mut config = echo_config();
        config.command = "/definitely/not/a/real/command-xyz".to_string();
        let session = BackendSession::new("broken", config, CancellationToken::new());
        let result = session.start().await;
        assert!(result.is_err());
        assert_eq!(session.state().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_call_after_terminate_is_unavailable() {
        let session = BackendSession::new("echo", echo_config(), CancellationToken::new());
        session.set_state(SessionState::Terminated).await;
        let result = session.call("tools/list", None, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(GatewayError::BackendUnavailable(_, _))));
    }
}
