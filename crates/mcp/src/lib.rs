//! MCP (Model Context Protocol) client library.
//!
//! This crate provides a client for communicating with MCP tool servers via
//! stdio. A [`Server`] handle is safe to share: concurrent `call_tool`
//! invocations are multiplexed over the single pipe and matched back to their
//! callers by request id.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{DEFAULT_TIMEOUT, Server, ServerConfig};
//! use std::collections::HashMap;
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig {
//!     name: "filesystem".to_string(),
//!     command: "mcp-filesystem".to_string(),
//!     args: vec!["--root".to_string(), "./workspace".to_string()],
//!     env: HashMap::new(),
//! };
//!
//! let server = Server::spawn(config).await?;
//! server.initialize().await?;
//!
//! for tool in server.tools().await {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = server
//!     .call_tool(
//!         "read_file",
//!         Some(serde_json::json!({"path": "./README.md"})),
//!         DEFAULT_TIMEOUT,
//!     )
//!     .await?;
//! println!("{}", result.text());
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod protocol;
mod server;

pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    ServerCapabilities, ServerInfo, Tool, ToolContent, ToolsCapability,
};
pub use server::{DEFAULT_TIMEOUT, MAX_OUTPUT_SIZE, Server, ServerConfig};
