//! Memory collaborator contract.
//!
//! The orchestrator may query memory before opening a turn and offers the
//! finalized turn afterwards for asynchronous learning. A failing (or absent)
//! memory implementation never blocks or fails a turn.

use crate::model::ToolResult;
use async_trait::async_trait;
use storage::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("memory error: {0}")]
pub struct MemoryError(pub String);

/// A completed turn, as offered to the memory collaborator.
#[derive(Debug, Clone)]
pub struct FinishedTurn {
    pub session: SessionId,
    pub input: String,
    pub tool_results: Vec<ToolResult>,
    pub answer: String,
}

#[async_trait]
pub trait Memory: Send + Sync {
    /// Fetch prior context relevant to `query`, to prepend to the turn.
    async fn recall(&self, query: &str) -> Result<Vec<String>, MemoryError>;

    /// Offer a finalized turn for learning.
    async fn retain(&self, turn: FinishedTurn) -> Result<(), MemoryError>;
}

/// Memory that remembers nothing. The default collaborator.
pub struct NoopMemory;

#[async_trait]
impl Memory for NoopMemory {
    async fn recall(&self, _query: &str) -> Result<Vec<String>, MemoryError> {
        Ok(Vec::new())
    }

    async fn retain(&self, _turn: FinishedTurn) -> Result<(), MemoryError> {
        Ok(())
    }
}
