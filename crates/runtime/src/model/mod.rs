//! Provider-agnostic model types and the streaming backend contract.

mod errors;
mod stream;
mod types;

pub use errors::ModelError;
pub use stream::{Backend, EventStream, StreamEvent};
pub use types::{
    FinishReason, Message, ModelRequest, Part, Role, ToolCall, ToolResult, ToolSpec, ToolStatus,
    Usage,
};
