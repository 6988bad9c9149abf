//! Core model types (provider-agnostic).
//!
//! These types represent the universal concepts shared across LLM providers.
//! Provider-specific wire details belong in adapter modules under
//! `crate::providers`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the turn; correlates the eventual result.
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// How a tool invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
    Timeout,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome of one tool invocation.
///
/// Created by the coordinator when a dispatch completes or is abandoned, and
/// consumed exactly once when the orchestrator folds it back into history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// ID of the [`ToolCall`] this result answers.
    pub call_id: String,
    pub status: ToolStatus,
    /// Tool output on success, diagnostic message otherwise.
    pub payload: String,
    /// Wall-clock time the invocation was live.
    pub elapsed: Duration,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, payload: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolStatus::Ok,
            payload: payload.into(),
            elapsed,
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        diagnostic: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolStatus::Error,
            payload: diagnostic.into(),
            elapsed,
        }
    }

    pub fn timeout(call_id: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            status: ToolStatus::Timeout,
            payload: format!("tool call timed out after {}ms", elapsed.as_millis()),
            elapsed,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// A part of a message, which can be text or a tool interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Part {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// A message, consisting of a role and one or more parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    /// Create a message with a role and text content.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Create the user-role message that carries tool results back to the
    /// model.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::User,
            parts: results.into_iter().map(Part::ToolResult).collect(),
        }
    }

    /// Get combined text content from all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool calls from this message.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the invocation arguments.
    pub schema: Value,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FinishReason {
    /// Natural end of response.
    #[default]
    Stop,
    /// Model wants to call tools.
    ToolUse,
    /// Hit token limit.
    Length,
    /// Unknown reason (forward compatibility).
    Unknown(String),
}

/// Everything needed to open one model call.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub max_tokens: u32,
    /// Reasoning-token budget; `None` disables extended thinking.
    pub thinking_budget: Option<u32>,
    pub system: Option<&'a str>,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
}
