//! Tool process management.
//!
//! The sequential-thinking tool runs as a long-lived child process that speaks
//! line-delimited JSON-RPC 2.0 over its stdin/stdout. One [`ToolProcessManager`]
//! owns that process for the whole lifetime of the server and is shared by
//! every chat request.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --handshake ok--> Ready
//!                                  |                         |
//!                                  +--handshake failed-----> Failed <--stdout closed--+
//! Ready/Failed --disconnect()--> Disconnected
//! ```
//!
//! The handshake is `initialize`, the `notifications/initialized` notification,
//! then `tools/list`.
//!
//! # Correlation
//!
//! Every request gets a fresh numeric id and a one-shot reply slot in a shared
//! pending table. A single reader task routes each response line to the slot
//! with the matching id, so concurrent callers never see each other's results.
//! Slots are removed by a guard when the caller returns, times out or is
//! cancelled, so abandoned requests never leak entries.

use crate::tools::SEQUENTIAL_THINKING;
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;

/// MCP protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const CLIENT_NAME: &str = "thinking-relay";

/// How to launch and talk to the tool process.
#[derive(Debug, Clone)]
pub struct ToolProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Bound on the whole initialize/list handshake
    pub handshake_timeout: Duration,
    /// Bound on a single `tools/call`
    pub invoke_timeout: Duration,
    /// Grace period between SIGTERM and a forced kill
    pub shutdown_timeout: Duration,
}

impl Default for ToolProcessConfig {
    fn default() -> Self {
        Self {
            command: crate::config::DEFAULT_TOOL_COMMAND.to_string(),
            args: crate::config::DEFAULT_TOOL_ARGS
                .iter()
                .map(|a| a.to_string())
                .collect(),
            handshake_timeout: Duration::from_secs(30),
            invoke_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection state of the tool process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Ready,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Text result of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Text parts of the result joined by newlines
    pub text: String,
    /// The tool flagged the result as an error (`isError`)
    pub is_error: bool,
}

impl ToolOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    /// Build from a `tools/call` result object.
    ///
    /// Results without a `content` array are passed through as their JSON text.
    pub fn from_call_result(result: &Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let text = match result.get("content").and_then(Value::as_array) {
            Some(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            None => result.to_string(),
        };

        Self { text, is_error }
    }
}

/// Something that can execute a named tool.
///
/// Implemented by [`ToolProcessManager`]; tests substitute scripted fakes.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput>;
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

impl<'a> JsonRpcRequest<'a> {
    fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params: Some(params),
            id: Some(id),
        }
    }

    fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params: None,
            id: None,
        }
    }
}

/// Any message the tool process writes to stdout.
#[derive(Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

type Reply = std::result::Result<Value, JsonRpcError>;
type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a pending slot when the waiting caller goes away.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    fn register(table: &'a PendingTable, id: u64) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        lock(table).insert(id, tx);
        (Self { table, id }, rx)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.id);
    }
}

/// Owner of the tool process and its JSON-RPC channel.
pub struct ToolProcessManager {
    config: ToolProcessConfig,
    status: Arc<Mutex<SessionStatus>>,
    pending: PendingTable,
    next_id: AtomicU64,
    writer: AsyncMutex<Option<BoxedWriter>>,
    child: AsyncMutex<Option<Child>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    tools: Mutex<Vec<String>>,
    shut_down: AtomicBool,
}

impl ToolProcessManager {
    pub fn new(config: ToolProcessConfig) -> Self {
        Self {
            config,
            status: Arc::new(Mutex::new(SessionStatus::Disconnected)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            writer: AsyncMutex::new(None),
            child: AsyncMutex::new(None),
            reader_task: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ToolProcessConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    pub fn is_ready(&self) -> bool {
        self.status() == SessionStatus::Ready
    }

    /// Tool names reported by `tools/list`.
    pub fn tools(&self) -> Vec<String> {
        lock(&self.tools).clone()
    }

    fn set_status(&self, status: SessionStatus) {
        let mut current = lock(&self.status);
        if *current != status {
            debug!("Tool process status: {} -> {}", *current, status);
            *current = status;
        }
    }

    /// Spawn the configured command and perform the handshake.
    ///
    /// On failure the manager is left in [`SessionStatus::Failed`] and every
    /// later [`invoke`](Self::invoke) fails immediately.
    pub async fn connect(&self) -> Result<()> {
        self.set_status(SessionStatus::Connecting);
        info!(
            "Starting tool process: {} {}",
            self.config.command,
            self.config.args.join(" ")
        );

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.set_status(SessionStatus::Failed);
                error!("Failed to spawn tool process `{}`: {}", self.config.command, e);
                Error::tool_unavailable(format!(
                    "failed to spawn `{}`: {}",
                    self.config.command, e
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.set_status(SessionStatus::Failed);
            return Err(Error::tool_unavailable("tool process stdio was not captured"));
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[tool stderr] {}", line);
                }
            });
        }

        *self.child.lock().await = Some(child);
        self.attach(stdout, stdin).await
    }

    /// Run the protocol over an already-open channel.
    ///
    /// [`connect`](Self::connect) uses this with the child's pipes; it also
    /// accepts any reader/writer pair, such as an in-memory duplex.
    pub async fn attach<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.set_status(SessionStatus::Connecting);
        *self.writer.lock().await = Some(Box::new(writer));

        let task = tokio::spawn(read_loop(
            BufReader::new(reader),
            Arc::clone(&self.pending),
            Arc::clone(&self.status),
        ));
        if let Some(previous) = lock(&self.reader_task).replace(task) {
            previous.abort();
        }

        let outcome = tokio::time::timeout(self.config.handshake_timeout, self.handshake()).await;
        match outcome {
            Ok(Ok(tools)) => {
                info!("Tool process ready, tools: {:?}", tools);
                *lock(&self.tools) = tools;
                self.set_status(SessionStatus::Ready);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Tool process handshake failed: {}", e);
                self.release_failed_session().await;
                self.set_status(SessionStatus::Failed);
                Err(Error::tool_unavailable(format!("handshake failed: {}", e)))
            }
            Err(_) => {
                error!(
                    "Tool process handshake timed out after {:?}",
                    self.config.handshake_timeout
                );
                self.release_failed_session().await;
                self.set_status(SessionStatus::Failed);
                Err(Error::tool_unavailable(format!(
                    "handshake timed out after {:?}",
                    self.config.handshake_timeout
                )))
            }
        }
    }

    /// Drop the channel and kill the process of a session that never became ready.
    async fn release_failed_session(&self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        self.writer.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tool process after handshake failure: {}", e);
            }
        }
        lock(&self.pending).clear();
    }

    async fn handshake(&self) -> Result<Vec<String>> {
        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            )
            .await?;
        debug!(
            "Tool process initialized: server={}, protocol={}",
            init.get("serverInfo").unwrap_or(&Value::Null),
            init.get("protocolVersion").unwrap_or(&Value::Null)
        );

        self.send(&JsonRpcRequest::notification("notifications/initialized"))
            .await?;

        let listed = self.request("tools/list", json!({})).await?;
        let tools: Vec<String> = listed
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if !tools.iter().any(|t| t == SEQUENTIAL_THINKING) {
            warn!(
                "Tool process does not list `{}`; calls to it will likely fail",
                SEQUENTIAL_THINKING
            );
        }
        Ok(tools)
    }

    /// Call a tool by name.
    ///
    /// Fails with [`Error::ToolUnavailable`] unless the session is ready, with
    /// [`Error::Timeout`] after `invoke_timeout`, and with [`Error::Tool`] if
    /// the process answers with a JSON-RPC error.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let status = self.status();
        if status != SessionStatus::Ready {
            return Err(Error::tool_unavailable(format!(
                "tool process is {}",
                status
            )));
        }

        debug!("tools/call {} {}", name, arguments);
        let call = self.request("tools/call", json!({"name": name, "arguments": arguments}));
        let result = tokio::time::timeout(self.config.invoke_timeout, call)
            .await
            .map_err(|_| {
                warn!(
                    "tools/call {} timed out after {:?}",
                    name, self.config.invoke_timeout
                );
                Error::timeout(format!(
                    "tools/call {} after {:?}",
                    name, self.config.invoke_timeout
                ))
            })??;

        Ok(ToolOutput::from_call_result(&result))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (_guard, rx) = PendingGuard::register(&self.pending, id);

        self.send(&JsonRpcRequest::call(id, method, params)).await?;

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(Error::tool(format!(
                "{} failed: {} (code {})",
                method, e.message, e.code
            ))),
            Err(_) => Err(Error::tool_unavailable(format!(
                "tool process closed before answering {}",
                method
            ))),
        }
    }

    async fn send(&self, message: &JsonRpcRequest<'_>) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| Error::tool_unavailable("tool process is not connected"))?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Stop the tool process.
    ///
    /// Closes stdin, sends SIGTERM, waits up to `shutdown_timeout` and then
    /// kills the process. Safe to call more than once; later calls do nothing.
    pub async fn disconnect(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Tool process already disconnected");
            return;
        }
        self.set_status(SessionStatus::Disconnected);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Closing tool process stdin: {}", e);
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            send_sigterm(&child);
            match tokio::time::timeout(self.config.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => info!("Tool process exited: {}", status),
                Ok(Err(e)) => warn!("Waiting for tool process failed: {}", e),
                Err(_) => {
                    warn!(
                        "Tool process did not exit within {:?}, killing it",
                        self.config.shutdown_timeout
                    );
                    if let Err(e) = child.kill().await {
                        error!("Failed to kill tool process: {}", e);
                    }
                }
            }
        }

        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        lock(&self.pending).clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[async_trait]
impl ToolInvoker for ToolProcessManager {
    async fn invoke(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        ToolProcessManager::invoke(self, name, arguments).await
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we spawned and still own.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!("SIGTERM to tool process {} failed", pid);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

async fn read_loop<R>(reader: BufReader<R>, pending: PendingTable, status: Arc<Mutex<SessionStatus>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route_message(&line, &pending),
            Ok(None) => {
                debug!("Tool process closed stdout");
                break;
            }
            Err(e) => {
                error!("Reading tool process stdout failed: {}", e);
                break;
            }
        }
    }

    {
        let mut status = lock(&status);
        if *status != SessionStatus::Disconnected {
            warn!("Tool process channel closed; marking session failed");
            *status = SessionStatus::Failed;
        }
    }
    // Dropping the senders wakes every waiter with a closed-channel error.
    lock(&pending).clear();
}

fn route_message(line: &str, pending: &PendingTable) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let message: JsonRpcMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(_) => {
            debug!("Ignoring non JSON-RPC output from tool process: {}", line);
            return;
        }
    };

    if let Some(method) = message.method {
        debug!("Tool process sent {}", method);
        return;
    }

    let Some(id) = message.id.as_ref().and_then(Value::as_u64) else {
        warn!("Ignoring tool process response without a numeric id: {}", line);
        return;
    };

    let reply = match message.error {
        Some(error) => Err(error),
        None => Ok(message.result.unwrap_or(Value::Null)),
    };

    match lock(pending).remove(&id) {
        Some(waiter) => {
            if waiter.send(reply).is_err() {
                debug!("Caller for request {} went away", id);
            }
        }
        None => warn!("Received response for unknown request id {}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    fn test_config() -> ToolProcessConfig {
        ToolProcessConfig {
            command: "unused".to_string(),
            args: vec![],
            handshake_timeout: Duration::from_secs(2),
            invoke_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn handshake_reply(request: &Value) -> Option<Value> {
        let id = request.get("id")?.clone();
        match request["method"].as_str()? {
            "initialize" => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "0.0.0"}
                }
            })),
            "tools/list" => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [{"name": "sequentialthinking", "inputSchema": {}}]}
            })),
            _ => None,
        }
    }

    async fn write_json(writer: &mut WriteHalf<DuplexStream>, value: &Value) {
        let mut line = value.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Fake tool server: answers the handshake, then hands every other request to `on_call`.
    /// An array reply is written as one line per element.
    fn spawn_server<F>(stream: DuplexStream, mut on_call: F) -> JoinHandle<()>
    where
        F: FnMut(&Value) -> Option<Value> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                if request.get("id").is_none() {
                    continue;
                }
                let reply = handshake_reply(&request).or_else(|| on_call(&request));
                match reply {
                    Some(Value::Array(replies)) => {
                        for reply in &replies {
                            write_json(&mut write, reply).await;
                        }
                    }
                    Some(reply) => write_json(&mut write, &reply).await,
                    None => {}
                }
            }
        })
    }

    fn text_result(id: &Value, text: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [{"type": "text", "text": text}]}
        })
    }

    fn pipes() -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        (read, write, server)
    }

    #[test]
    fn test_tool_output_from_call_result() {
        let output = ToolOutput::from_call_result(&json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "second"}
            ],
            "isError": true
        }));
        assert_eq!(output.text, "first\nsecond");
        assert!(output.is_error);

        let raw = ToolOutput::from_call_result(&json!({"value": 1}));
        assert_eq!(raw.text, r#"{"value":1}"#);
        assert!(!raw.is_error);
    }

    #[test]
    fn test_request_serialization() {
        let call = serde_json::to_value(JsonRpcRequest::call(7, "tools/call", json!({"name": "x"}))).unwrap();
        assert_eq!(
            call,
            json!({"jsonrpc": "2.0", "method": "tools/call", "params": {"name": "x"}, "id": 7})
        );

        let note = serde_json::to_value(JsonRpcRequest::notification("notifications/initialized")).unwrap();
        assert_eq!(note, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
    }

    #[tokio::test]
    async fn test_invoke_before_connect_is_unavailable() {
        let manager = ToolProcessManager::new(test_config());
        assert_eq!(manager.status(), SessionStatus::Disconnected);

        let err = manager.invoke("sequentialthinking", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn test_handshake_and_invoke() {
        let (read, write, server) = pipes();
        spawn_server(server, |request| {
            assert_eq!(request["method"], "tools/call");
            assert_eq!(request["params"]["name"], "sequentialthinking");
            let args = request["params"]["arguments"].to_string();
            Some(text_result(&request["id"], &args))
        });

        let manager = ToolProcessManager::new(test_config());
        manager.attach(read, write).await.unwrap();
        assert_eq!(manager.status(), SessionStatus::Ready);
        assert_eq!(manager.tools(), vec!["sequentialthinking".to_string()]);

        let output = manager
            .invoke("sequentialthinking", json!({"nextThoughtNeeded": false}))
            .await
            .unwrap();
        assert_eq!(output.text, r#"{"nextThoughtNeeded":false}"#);
        assert!(!output.is_error);
        assert_eq!(manager.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_correlated_by_id() {
        let (read, write, server) = pipes();

        // Hold the first call until the second arrives, then answer in reverse order.
        let mut held: Option<Value> = None;
        spawn_server(server, move |request| {
            let label = request["params"]["arguments"]["label"].as_str().unwrap().to_string();
            match held.take() {
                None => {
                    held = Some(request.clone());
                    None
                }
                Some(first) => {
                    // Queue the reply to the first call behind the second one.
                    let first_label = first["params"]["arguments"]["label"].as_str().unwrap().to_string();
                    let second = text_result(&request["id"], &label);
                    let first = text_result(&first["id"], &first_label);
                    Some(json!([second, first]))
                }
            }
        });

        let manager = Arc::new(ToolProcessManager::new(test_config()));
        manager.attach(read, write).await.unwrap();

        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.invoke("sequentialthinking", json!({"label": "a"})).await })
        };
        // Make sure "a" is registered first.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.invoke("sequentialthinking", json!({"label": "b"})).await })
        };

        assert_eq!(a.await.unwrap().unwrap().text, "a");
        assert_eq!(b.await.unwrap().unwrap().text, "b");
        assert_eq!(manager.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_invoke_timeout_releases_pending_slot() {
        let (read, write, server) = pipes();
        spawn_server(server, |_| None);

        let config = ToolProcessConfig {
            invoke_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let manager = ToolProcessManager::new(config);
        manager.attach(read, write).await.unwrap();

        let err = manager.invoke("sequentialthinking", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(manager.pending_len(), 0);
        // A timeout does not poison the session.
        assert_eq!(manager.status(), SessionStatus::Ready);
    }

    #[tokio::test]
    async fn test_cancelled_invoke_releases_pending_slot() {
        let (read, write, server) = pipes();
        spawn_server(server, |_| None);

        let manager = Arc::new(ToolProcessManager::new(test_config()));
        manager.attach(read, write).await.unwrap();

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.invoke("sequentialthinking", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.pending_len(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(manager.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_json_rpc_error_becomes_tool_error() {
        let (read, write, server) = pipes();
        spawn_server(server, |request| {
            Some(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32602, "message": "Invalid params"}
            }))
        });

        let manager = ToolProcessManager::new(test_config());
        manager.attach(read, write).await.unwrap();

        match manager.invoke("sequentialthinking", json!({})).await {
            Err(Error::Tool(msg)) => assert!(msg.contains("Invalid params")),
            other => panic!("Expected tool error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout_marks_failed() {
        let (read, write, _server) = pipes();
        let config = ToolProcessConfig {
            handshake_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let manager = ToolProcessManager::new(config);

        let err = manager.attach(read, write).await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
        assert_eq!(manager.status(), SessionStatus::Failed);

        let err = manager.invoke("sequentialthinking", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_the_channel() {
        let (read, write, mut server) = pipes();
        let config = ToolProcessConfig {
            handshake_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let manager = ToolProcessManager::new(config);

        manager.attach(read, write).await.unwrap_err();

        // The server side sees the initialize request and then end of input.
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), server.read_to_end(&mut received))
            .await
            .expect("channel was left open after a failed handshake")
            .unwrap();
        assert!(String::from_utf8_lossy(&received).contains("\"initialize\""));
        assert!(lock(&manager.reader_task).is_none());
        assert_eq!(manager.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_handshake_sends_initialized_notification_without_id() {
        let (read, write, server) = pipes();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                recorded.lock().unwrap().push(request.clone());
                if let Some(reply) = handshake_reply(&request) {
                    write_json(&mut server_write, &reply).await;
                }
            }
        });

        let manager = ToolProcessManager::new(test_config());
        manager.attach(read, write).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        let methods: Vec<&str> = seen.iter().map(|r| r["method"].as_str().unwrap()).collect();
        assert_eq!(
            methods,
            vec!["initialize", "notifications/initialized", "tools/list"]
        );
        assert!(seen[1].get("id").is_none());
        assert!(seen[0].get("id").is_some());
    }

    #[tokio::test]
    async fn test_closed_output_fails_session_and_wakes_callers() {
        let (read, write, server) = pipes();
        // Complete the handshake, then hang up on the first tool call.
        let handle = spawn_server(server, |_| None);

        let manager = Arc::new(ToolProcessManager::new(test_config()));
        manager.attach(read, write).await.unwrap();

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.invoke("sequentialthinking", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
        assert_eq!(manager.status(), SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (read, write, server) = pipes();
        spawn_server(server, |_| None);

        let manager = ToolProcessManager::new(test_config());
        manager.attach(read, write).await.unwrap();

        manager.disconnect().await;
        assert_eq!(manager.status(), SessionStatus::Disconnected);
        manager.disconnect().await;
        assert_eq!(manager.status(), SessionStatus::Disconnected);

        let err = manager.invoke("sequentialthinking", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn test_connect_with_missing_command_fails() {
        let config = ToolProcessConfig {
            command: "/nonexistent/thinking-tool-binary".to_string(),
            ..test_config()
        };
        let manager = ToolProcessManager::new(config);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
        assert_eq!(manager.status(), SessionStatus::Failed);
    }
}
