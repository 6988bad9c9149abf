//! Remote tool connectors.
//!
//! A connector owns the session with one external tool-providing process.
//! The registry binds remote tools through the [`RemoteConnector`] trait so
//! the transport stays swappable (and fakeable in tests).

use super::ToolError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// The call surface of one tool server.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    fn server_name(&self) -> &str;

    /// Invoke `tool` with `args`, waiting at most `deadline`.
    ///
    /// Connection loss surfaces as [`ToolError::Transport`]; the connector
    /// itself never retries.
    async fn call(&self, tool: &str, args: Value, deadline: Duration)
    -> Result<String, ToolError>;
}

/// MCP-backed connector.
///
/// Shared across every session that uses the server; the underlying
/// [`mcp::Server`] multiplexes concurrent calls by request id.
pub struct McpConnector {
    server: Arc<mcp::Server>,
}

impl McpConnector {
    pub fn new(server: Arc<mcp::Server>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RemoteConnector for McpConnector {
    fn server_name(&self) -> &str {
        self.server.name()
    }

    async fn call(
        &self,
        tool: &str,
        args: Value,
        deadline: Duration,
    ) -> Result<String, ToolError> {
        let arguments = match args {
            Value::Null => None,
            other => Some(other),
        };

        match self.server.call_tool(tool, arguments, deadline).await {
            Ok(result) => Ok(result.text()),
            Err(mcp::Error::Timeout) => Err(ToolError::Timeout(deadline.as_millis() as u64)),
            Err(mcp::Error::ToolCallFailed(message)) => Err(ToolError::Execution(message)),
            Err(error @ (mcp::Error::ServerExited | mcp::Error::Spawn(_))) => {
                Err(ToolError::Transport(error.to_string()))
            }
            Err(error) => Err(ToolError::Transport(error.to_string())),
        }
    }
}
