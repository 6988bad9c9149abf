//! Tool contracts: local in-process tools and remote connectors.

mod builtin;
mod remote;

pub use builtin::{Calculator, Clock, builtin_tools};
pub use remote::{McpConnector, RemoteConnector};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during tool execution.
///
/// These never escape the coordinator as `Err`: each one is rendered into a
/// failed result and handed back to the model as information.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("execution failed: {0}")]
    Execution(String),
}

/// An in-process capability the registry can load.
///
/// Anything satisfying this contract is loadable, independent of how it is
/// implemented. The registry compiles `schema()` at load time; a tool whose
/// schema does not compile is excluded, not fatal.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &str;

    /// Natural-language description the model uses for selection.
    fn description(&self) -> &str;

    /// JSON Schema for the invocation arguments.
    fn schema(&self) -> Value;

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}
