//! The incremental model-stream contract.

use super::errors::ModelError;
use super::types::{FinishReason, ModelRequest, ToolCall, Usage};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// One incremental event from an in-progress model response.
///
/// Tool invocations are atomic: the provider buffers partial argument
/// fragments internally and only emits [`StreamEvent::ToolCall`] once the
/// invocation is fully materialized.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A fragment of visible answer text.
    TextDelta(String),
    /// A fragment of the model's reasoning.
    ThinkingDelta(String),
    /// The model began emitting a tool invocation (arguments still arriving).
    ToolCallStarted { id: String, name: String },
    /// A fully-formed tool invocation.
    ToolCall(ToolCall),
    /// The response is complete.
    Finished { reason: FinishReason, usage: Usage },
}

/// A live model response stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

/// Trait for LLM provider backends.
///
/// Opening a call sends the full message history plus the advertised tool
/// descriptors, and yields the incremental event stream.
pub trait Backend: Send + Sync {
    fn open(
        &self,
        request: ModelRequest<'_>,
    ) -> impl Future<Output = Result<EventStream, ModelError>> + Send;
}
