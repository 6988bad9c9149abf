//! Session state: ordered conversation history plus live configuration.
//!
//! Append-only during a live session; only [`Session::reset`] truncates.
//! Exactly one writer exists per session (its orchestrator) — the mutating
//! methods are crate-private for that reason. Every mutation is mirrored into
//! the storage event log.

use crate::Result;
use crate::model::{Message, Part, Role, ToolResult, Usage};
use std::time::Duration;
use storage::{Event, EventKind, EventStore, SessionId};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Per-session configuration.
///
/// The orchestrator copies this at turn open; changes made mid-turn take
/// effect on the next turn, never the current one.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Model identifier.
    pub model: String,
    /// Max output tokens per model call.
    pub max_tokens: u32,
    /// Reasoning-token budget; `None` disables extended thinking.
    pub thinking_budget: Option<u32>,
    /// Max tool-round iterations per turn.
    pub max_tool_rounds: u32,
    /// Per-call tool timeout.
    pub tool_timeout: Duration,
    /// Dispatch concurrency ceiling.
    pub concurrency: usize,
    /// History window (entries) sent with each model call.
    pub max_history: usize,
    /// Whether the memory collaborator participates in turns.
    pub memory_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            thinking_budget: None,
            max_tool_rounds: 8,
            tool_timeout: Duration::from_secs(30),
            concurrency: 4,
            max_history: 40,
            memory_enabled: false,
        }
    }
}

/// One entry in the conversation history.
#[derive(Debug, Clone)]
pub enum Entry {
    User { text: String },
    Assistant { parts: Vec<Part> },
    ToolResults { results: Vec<ToolResult> },
}

/// A conversation session.
pub struct Session {
    pub id: SessionId,
    store: EventStore,
    config: SessionConfig,
    system: Option<String>,
    entries: Vec<Entry>,
}

impl Session {
    pub fn new(store: EventStore, config: SessionConfig) -> Result<Self> {
        let id = SessionId::new();
        store.append(&Event::new(id, EventKind::SessionStart))?;

        Ok(Self {
            id,
            store,
            config,
            system: None,
            entries: Vec::new(),
        })
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect at the next turn open.
    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Drop all history. The only truncation a live session allows.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// The recent history as model messages.
    ///
    /// Bounded to roughly `max_entries` entries; the window is advanced to
    /// start at a user entry so an assistant tool call is never separated
    /// from the results that answer it.
    pub fn window(&self, max_entries: usize) -> Vec<Message> {
        let entries = if max_entries > 0 && self.entries.len() > max_entries {
            &self.entries[self.entries.len() - max_entries..]
        } else {
            &self.entries[..]
        };

        let start = entries
            .iter()
            .position(|e| matches!(e, Entry::User { .. }))
            .unwrap_or(0);

        entries[start..].iter().map(entry_to_message).collect()
    }

    pub(crate) fn push_user(&mut self, text: &str) -> Result<()> {
        self.entries.push(Entry::User {
            text: text.to_string(),
        });
        self.store
            .append(&Event::message(self.id, storage::Role::User, text))?;
        Ok(())
    }

    pub(crate) fn push_assistant(&mut self, parts: Vec<Part>, round: u32) -> Result<()> {
        for part in &parts {
            match part {
                Part::Text(text) if !text.is_empty() => {
                    self.store.append(&Event::message(
                        self.id,
                        storage::Role::Assistant,
                        text.clone(),
                    ))?;
                }
                Part::ToolCall(call) => {
                    self.store.append(&Event::new(
                        self.id,
                        EventKind::ToolCall {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                            round,
                        },
                    ))?;
                }
                _ => {}
            }
        }
        self.entries.push(Entry::Assistant { parts });
        Ok(())
    }

    pub(crate) fn push_tool_results(&mut self, results: Vec<ToolResult>) -> Result<()> {
        for result in &results {
            self.store.append(&Event::new(
                self.id,
                EventKind::ToolResult {
                    call_id: result.call_id.clone(),
                    status: result.status.to_string(),
                    payload: result.payload.clone(),
                    duration_ms: result.elapsed.as_millis() as u64,
                },
            ))?;
        }
        self.entries.push(Entry::ToolResults { results });
        Ok(())
    }

    pub(crate) fn push_turn_completed(&mut self, rounds: u32, usage: Usage) -> Result<()> {
        self.store.append(&Event::new(
            self.id,
            EventKind::TurnCompleted {
                rounds,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            },
        ))?;
        Ok(())
    }

    /// End the session.
    pub fn end(self) -> Result<()> {
        self.store
            .append(&Event::new(self.id, EventKind::SessionEnd))?;
        Ok(())
    }
}

fn entry_to_message(entry: &Entry) -> Message {
    match entry {
        Entry::User { text } => Message::user(text.clone()),
        Entry::Assistant { parts } => Message {
            role: Role::Assistant,
            parts: parts.clone(),
        },
        Entry::ToolResults { results } => Message::tool_results(results.clone()),
    }
}
