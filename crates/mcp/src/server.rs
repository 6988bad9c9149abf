//! MCP server management (spawn, communicate, lifecycle).
//!
//! A [`Server`] owns one external tool-server process. Requests are written to
//! the child's stdin and a single reader task routes responses back to callers
//! by JSON-RPC id, so any number of tasks may issue calls against a shared
//! handle without interleaving each other's replies.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcMessage,
    JsonRpcRequest, JsonRpcResponse, ListToolsResult, Tool,
};

/// Default timeout for MCP handshake and listing operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Maximum accepted line size (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Configuration for an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Handle to a running MCP server.
pub struct Server {
    config: ServerConfig,
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicI64,
    initialized: AtomicBool,
    server_info: Mutex<Option<InitializeResult>>,
    tools: Mutex<Vec<Tool>>,
    reader: JoinHandle<()>,
}

impl Server {
    /// Spawn a new MCP server process and start its response router.
    pub async fn spawn(config: ServerConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn()?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdin")))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(std::io::Error::other("failed to capture stdout")))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(route_responses(
            BufReader::new(stdout),
            Arc::clone(&pending),
            config.name.clone(),
        ));

        Ok(Self {
            config,
            child: Mutex::new(process),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            server_info: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            reader,
        })
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Initialize the server (must be called before other operations).
    pub async fn initialize(&self) -> Result<&Self> {
        let params = InitializeParams::default();
        let result: InitializeResult = self
            .request("initialize", Some(params), DEFAULT_TIMEOUT)
            .await?;

        // Send initialized notification
        self.notify("notifications/initialized", None::<()>).await?;

        *self.server_info.lock().await = Some(result);
        self.initialized.store(true, Ordering::SeqCst);

        self.refresh_tools().await?;

        Ok(self)
    }

    /// Check if the server is initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Get server info (after initialization).
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server_info.lock().await.clone()
    }

    /// Refresh the list of available tools.
    pub async fn refresh_tools(&self) -> Result<()> {
        let result: ListToolsResult = self
            .request("tools/list", None::<()>, DEFAULT_TIMEOUT)
            .await?;
        *self.tools.lock().await = result.tools;
        Ok(())
    }

    /// Get the list of available tools.
    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.lock().await.clone()
    }

    /// Call a tool by name, waiting at most `deadline` for the reply.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        deadline: Duration,
    ) -> Result<CallToolResult> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let result: CallToolResult = self.request("tools/call", Some(params), deadline).await?;

        if result.is_error {
            return Err(Error::ToolCallFailed(result.text()));
        }

        Ok(result)
    }

    /// Check if the server process is still running.
    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Shut down the server.
    pub async fn shutdown(&self) {
        let _ = self.notify("shutdown", None::<()>).await;
        self.reader.abort();
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }

    // --- Internal methods ---

    async fn request<P, R>(&self, method: &str, params: Option<P>, deadline: Duration) -> Result<R>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut request = JsonRpcRequest::new(id, method);
        if let Some(p) = params {
            request = request.with_params(p);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.write_line(&serde_json::to_string(&request)?).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match timeout(deadline, rx).await {
            Ok(Ok(response)) => response,
            // Router dropped the sender: process exited or stdout closed.
            Ok(Err(_)) => return Err(Error::ServerExited),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Timeout);
            }
        };

        let result_value = response.into_result()?;
        let result: R = serde_json::from_value(result_value)?;
        Ok(result)
    }

    async fn notify<P>(&self, method: &str, params: Option<P>) -> Result<()>
    where
        P: serde::Serialize,
    {
        // Notifications have no ID
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.and_then(|p| serde_json::to_value(p).ok())
        });

        self.write_line(&serde_json::to_string(&notification)?)
            .await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Read the child's stdout and route each response to its waiting caller.
///
/// Runs until the process closes stdout. Responses nobody is waiting for
/// (caller timed out or gave up) are dropped. On exit the pending map is
/// drained so every outstanding caller observes `ServerExited`.
async fn route_responses(
    mut stdout: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    server: String,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        if line.len() > MAX_OUTPUT_SIZE {
            tracing::warn!(server, size = line.len(), "dropping oversized line");
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(JsonRpcMessage::Response(response)) => {
                let waiter = pending.lock().await.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::debug!(server, id = response.id, "response with no waiter");
                    }
                }
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                tracing::debug!(server, method = %notification.method, "server notification");
            }
            Err(e) => {
                tracing::warn!(server, error = %e, "unparseable line from server");
            }
        }
    }

    pending.lock().await.clear();
}
