//! Client for an external tool server speaking JSON-RPC 2.0 over stdio.
//!
//! # Lifecycle
//! 1. Spawn the configured command with piped stdin/stdout/stderr.
//! 2. Send `initialize`, await the response, store the server identity.
//! 3. Send the `initialized` notification.
//! 4. Send `tools/list` to discover the server's tool catalog.
//! 5. Serve `tools/call` requests until shutdown or crash.
//!
//! # Concurrency
//! Many calls may be outstanding against one child. All writes share the
//! stdin handle behind an async mutex (interleaved writes would corrupt the
//! line-delimited stream); a single reader task owns stdout and resolves
//! waiters from a pending-request table keyed by id. Responses may arrive in
//! any order.
//!
//! # Failure
//! A call timeout removes the pending entry and leaves the child running; a
//! late reply finds no waiter and is dropped. EOF on stdout fails every
//! pending request and announces the crash on the event bus. stderr is
//! drained into a bounded ring buffer for diagnostics and never parsed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex as TokioMutex, oneshot};

use super::protocol::{
    Frame, JsonRpcError, JsonRpcNotification, JsonRpcRequest, PROTOCOL_VERSION,
    method_not_found_reply,
};
use crate::error::{EngineError, Result};
use crate::event_bus::{EngineEvent, EventBus};
use crate::tools::traits::PermissionLevel;

/// Lines retained from the child's stderr.
const STDERR_RING_LINES: usize = 200;

/// How often the shutdown grace loop re-checks the pending table.
const GRACE_POLL: Duration = Duration::from_millis(10);

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<TokioMutex<Option<BoxWriter>>>;
type Waiter = oneshot::Sender<std::result::Result<Value, JsonRpcError>>;

// ─── Config ──────────────────────────────────────────────────────────────────

/// Configuration for one external tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerConfig {
    /// Provider id; also the namespace prefix on tool-name collisions.
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Explicit environment entries; secrets are passed only through here.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// When false, the child starts from an empty environment plus `env`.
    #[serde(default)]
    pub inherit_env: bool,
    #[serde(default = "default_initialize_timeout_ms")]
    pub initialize_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Orderly-shutdown wait for pending requests.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Wait for the child to exit after stdin closes, before force-kill.
    #[serde(default = "default_kill_ms")]
    pub kill_ms: u64,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Permission level assigned to every tool this server exposes.
    #[serde(default = "default_permission_level")]
    pub permission_level: PermissionLevel,
}

fn default_initialize_timeout_ms() -> u64 {
    10_000
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_grace_ms() -> u64 {
    2_000
}
fn default_kill_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}
fn default_max_restart_attempts() -> u32 {
    5
}
fn default_permission_level() -> PermissionLevel {
    PermissionLevel::Execute
}

impl McpServerConfig {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            inherit_env: false,
            initialize_timeout_ms: default_initialize_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            grace_ms: default_grace_ms(),
            kill_ms: default_kill_ms(),
            auto_restart: true,
            max_restart_attempts: default_max_restart_attempts(),
            permission_level: default_permission_level(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

// ─── Discovered metadata ─────────────────────────────────────────────────────

/// Server identity from the `initialize` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Value,
}

/// One tool advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

// ─── Shared state ────────────────────────────────────────────────────────────

struct Shared {
    provider_id: String,
    pending: StdMutex<HashMap<u64, Waiter>>,
    /// True while the child process is believed to be running.
    alive: AtomicBool,
    /// False once shutdown begins; new requests are refused.
    accepting: AtomicBool,
    malformed_lines: AtomicU64,
    stderr_ring: StdMutex<VecDeque<String>>,
    bus: Option<Arc<dyn EventBus>>,
}

impl Shared {
    fn push_stderr(&self, line: String) {
        if let Ok(mut ring) = self.stderr_ring.lock() {
            if ring.len() == STDERR_RING_LINES {
                ring.pop_front();
            }
            ring.push_back(line);
        }
    }

    fn resolve(&self, id: u64, result: std::result::Result<Value, JsonRpcError>) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        match waiter {
            // The waiter may have timed out or been cancelled; a late reply
            // is dropped silently.
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => log::debug!("mcp[{}]: dropping late reply for id {id}", self.provider_id),
        }
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Fail every outstanding request by dropping its waiter.
    fn fail_all_pending(&self) -> usize {
        self.pending.lock().map(|mut p| p.drain().count()).unwrap_or(0)
    }

    /// Crash path: transition to dead exactly once, fail pending requests,
    /// and announce the crash.
    fn mark_crashed(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return; // orderly shutdown already marked us dead
        }
        self.accepting.store(false, Ordering::SeqCst);
        let failed = self.fail_all_pending();
        log::warn!(
            "mcp[{}]: server exited unexpectedly, failed {failed} pending request(s)",
            self.provider_id
        );
        if let Some(bus) = &self.bus {
            let _ = bus.publish(EngineEvent::ProviderCrashed {
                provider_id: self.provider_id.clone(),
                pending_failed: failed,
            });
        }
    }
}

/// Removes a pending entry when the requesting future is dropped before the
/// reader resolved it, so ids never leak.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

// ─── I/O tasks ───────────────────────────────────────────────────────────────

async fn write_frame(stdin: &SharedWriter, frame: &Value) -> std::io::Result<()> {
    let mut line = frame.to_string();
    line.push('\n');
    let mut guard = stdin.lock().await;
    match guard.as_mut() {
        Some(writer) => {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        None => Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "stdin closed",
        )),
    }
}

/// Single reader over the child's stdout. Ends on EOF or read error, which is
/// the crash signal.
async fn reader_loop(stdout: impl AsyncRead + Unpin, stdin: SharedWriter, shared: Arc<Shared>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        match Frame::classify(&line) {
            Frame::Response { id, result } => shared.resolve(id, result),
            Frame::Notification { method } => {
                log::debug!("mcp[{}]: ignoring notification '{method}'", shared.provider_id);
            }
            Frame::ServerRequest { id, method } => {
                // We expose no callable methods to the server.
                let reply = method_not_found_reply(&id, &method);
                if let Err(e) = write_frame(&stdin, &reply).await {
                    log::debug!("mcp[{}]: failed to answer server request: {e}", shared.provider_id);
                }
            }
            Frame::Malformed => {
                shared.malformed_lines.fetch_add(1, Ordering::SeqCst);
                shared.push_stderr(format!("[malformed stdout] {line}"));
            }
        }
    }
    shared.mark_crashed();
}

async fn stderr_loop(stderr: impl AsyncRead + Unpin, shared: Arc<Shared>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        shared.push_stderr(line);
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Manages one external tool-server process.
pub struct McpClient {
    config: McpServerConfig,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    stdin: SharedWriter,
    child: TokioMutex<Option<tokio::process::Child>>,
    server_info: StdMutex<Option<ServerInfo>>,
    tools: StdMutex<Vec<McpToolInfo>>,
}

impl McpClient {
    pub fn new(config: McpServerConfig, bus: Option<Arc<dyn EventBus>>) -> Self {
        let shared = Arc::new(Shared {
            provider_id: config.id.clone(),
            pending: StdMutex::new(HashMap::new()),
            alive: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            malformed_lines: AtomicU64::new(0),
            stderr_ring: StdMutex::new(VecDeque::new()),
            bus,
        });
        Self {
            config,
            shared,
            next_id: AtomicU64::new(0),
            stdin: Arc::new(TokioMutex::new(None)),
            child: TokioMutex::new(None),
            server_info: StdMutex::new(None),
            tools: StdMutex::new(Vec::new()),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Server identity captured during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().ok().and_then(|i| i.clone())
    }

    /// The most recently discovered tool catalog.
    pub fn tools(&self) -> Vec<McpToolInfo> {
        self.tools.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Count of unparseable stdout lines seen over this client's lifetime.
    pub fn malformed_line_count(&self) -> u64 {
        self.shared.malformed_lines.load(Ordering::SeqCst)
    }

    /// Tail of the child's stderr (plus raw malformed stdout lines).
    pub fn stderr_tail(&self) -> Vec<String> {
        self.shared
            .stderr_ring
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Startup ──────────────────────────────────────────────────────────────

    /// Spawn the server and complete the MCP handshake. Safe to call again
    /// after a crash or shutdown (a fresh process is spawned).
    pub async fn start(&self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }

        which::which(&self.config.command).map_err(|_| {
            EngineError::Config(format!(
                "tool server command '{}' not found on PATH",
                self.config.command
            ))
        })?;

        let mut cmd = tokio::process::Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if !self.config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&self.config.env);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::ProviderUnavailable {
            provider: self.config.id.clone(),
            reason: format!("failed to spawn '{}': {e}", self.config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| EngineError::Internal(
            "spawned child has no stdin pipe".into(),
        ))?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Internal(
            "spawned child has no stdout pipe".into(),
        ))?;
        let stderr = child.stderr.take().ok_or_else(|| EngineError::Internal(
            "spawned child has no stderr pipe".into(),
        ))?;

        *self.stdin.lock().await = Some(Box::new(stdin));
        *self.child.lock().await = Some(child);
        self.shared.alive.store(true, Ordering::SeqCst);
        self.shared.accepting.store(true, Ordering::SeqCst);

        tokio::spawn(reader_loop(
            stdout,
            Arc::clone(&self.stdin),
            Arc::clone(&self.shared),
        ));
        tokio::spawn(stderr_loop(stderr, Arc::clone(&self.shared)));

        // ── Handshake ────────────────────────────────────────────────────────
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "ordis",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let init_result = self
            .request(
                "initialize",
                Some(init_params),
                Duration::from_millis(self.config.initialize_timeout_ms),
            )
            .await?
            .map_err(|e| EngineError::ProviderUnavailable {
                provider: self.config.id.clone(),
                reason: format!("initialize rejected: {} ({})", e.message, e.code),
            })?;

        let info = ServerInfo {
            name: init_result
                .pointer("/serverInfo/name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            version: init_result
                .pointer("/serverInfo/version")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            capabilities: init_result.get("capabilities").cloned().unwrap_or(Value::Null),
        };
        if let Ok(mut slot) = self.server_info.lock() {
            *slot = Some(info.clone());
        }

        let notification =
            serde_json::to_value(JsonRpcNotification::new("notifications/initialized"))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        write_frame(&self.stdin, &notification)
            .await
            .map_err(|e| EngineError::ProviderUnavailable {
                provider: self.config.id.clone(),
                reason: format!("failed to send initialized notification: {e}"),
            })?;

        // ── Discovery ────────────────────────────────────────────────────────
        let list_result = self
            .request(
                "tools/list",
                None,
                Duration::from_millis(self.config.call_timeout_ms),
            )
            .await?
            .map_err(|e| EngineError::ProviderUnavailable {
                provider: self.config.id.clone(),
                reason: format!("tools/list rejected: {}", e.message),
            })?;

        let tools: Vec<McpToolInfo> = list_result
            .get("tools")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        log::info!(
            "mcp[{}]: server '{}' v{} ready, {} tool(s) discovered",
            self.config.id,
            info.name,
            info.version,
            tools.len()
        );
        if let Ok(mut slot) = self.tools.lock() {
            *slot = tools;
        }

        Ok(())
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Issue one request and await its correlated response.
    ///
    /// The outer `Result` carries transport-level failures (down, timeout,
    /// crash); the inner one carries JSON-RPC error responses.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<std::result::Result<Value, JsonRpcError>> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ProviderUnavailable {
                provider: self.config.id.clone(),
                reason: "tool server is not running".into(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .map_err(|_| EngineError::Internal("pending table poisoned".into()))?;
            pending.insert(id, tx);
        }
        // Dropping this future (caller timeout, cancellation) must remove the
        // entry; late replies then find nothing and are discarded.
        let guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let frame = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        write_frame(&self.stdin, &frame)
            .await
            .map_err(|e| EngineError::ProviderUnavailable {
                provider: self.config.id.clone(),
                reason: format!("write failed: {e}"),
            })?;

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match outcome {
            // Deadline exceeded: the entry is gone, the child is left alone.
            Err(_) => Err(EngineError::ToolTimeout(
                format!("{}:{method}", self.config.id),
                timeout.as_millis() as u64,
            )),
            // Waiter dropped: the process died with this request in flight.
            Ok(Err(_)) => Err(EngineError::ToolProvider {
                provider: self.config.id.clone(),
                reason: "server exited with the request in flight".into(),
            }),
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// Invoke one tool on the server.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<crate::tools::traits::ToolResult> {
        use crate::tools::traits::ToolResult;

        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.call_timeout_ms));
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let response = self.request("tools/call", Some(params), timeout).await?;

        Ok(match response {
            Err(e) => ToolResult::err(format!("MCP error {}: {}", e.code, e.message)),
            Ok(result) => render_tool_result(&result),
        })
    }

    /// Liveness probe: `ping` must answer within the deadline.
    pub async fn ping(&self, timeout: Duration) -> bool {
        if !self.is_alive() {
            return false;
        }
        matches!(self.request("ping", None, timeout).await, Ok(Ok(_)))
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Orderly shutdown: refuse new requests, give pending ones a grace
    /// window, close stdin (the termination signal stdio servers honor),
    /// wait, then force-kill.
    pub async fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.grace_ms);
        while self.shared.pending_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(GRACE_POLL).await;
        }

        self.shutdown_abrupt().await;
    }

    /// Shutdown without the grace window (supervisor failure path).
    pub async fn shutdown_abrupt(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        // Mark dead first so the reader's EOF is not treated as a crash.
        self.shared.alive.store(false, Ordering::SeqCst);
        let failed = self.shared.fail_all_pending();
        if failed > 0 {
            log::debug!("mcp[{}]: abandoned {failed} pending request(s) at shutdown", self.config.id);
        }

        // Closing stdin asks the server to exit.
        self.stdin.lock().await.take();

        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            let exited = tokio::time::timeout(
                Duration::from_millis(self.config.kill_ms),
                child.wait(),
            )
            .await;
            if exited.is_err() {
                log::warn!("mcp[{}]: force-killing unresponsive server", self.config.id);
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
        log::info!("mcp[{}]: stopped", self.config.id);
    }
}

/// Render a `tools/call` result object into a [`ToolResult`].
///
/// The MCP shape is `{ "content": [ {"type": "text", "text": …}, … ],
/// "isError": bool }`; non-text content items are passed through as JSON.
fn render_tool_result(result: &Value) -> crate::tools::traits::ToolResult {
    use crate::tools::traits::ToolResult;

    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let text = match result.get("content").and_then(|c| c.as_array()) {
        Some(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    };
    if is_error {
        ToolResult::err(text)
    } else {
        ToolResult::ok(text)
    }
}
