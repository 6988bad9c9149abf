//! Helmsman runtime — the streaming tool-injection orchestrator.
//!
//! This crate drives a model conversation while concurrently executing the
//! tool calls the model requests mid-stream, feeding their results back into
//! the same turn so later reasoning can use them.
//!
//! # Overview
//!
//! The runtime is organized around these concepts:
//!
//! - **Session**: the ordered conversation history plus live configuration;
//!   one writer, append-only, mirrored into the storage event log.
//! - **ToolRegistry**: merges local tools and MCP tool-server capabilities
//!   into immutable versioned snapshots, safe to reload while dispatches are
//!   in flight.
//! - **Coordinator**: executes one batch of tool invocations concurrently
//!   under a bounded ceiling, with per-call validation and timeouts, always
//!   returning results in submission order.
//! - **Orchestrator**: the turn loop — stream the model, detect tool
//!   invocations, dispatch, fold results back, continue until a final answer
//!   or the round limit.
//! - **Backend**: the provider seam; [`providers::AnthropicBackend`] streams
//!   the Anthropic Messages API.
//!
//! # Example
//!
//! ```ignore
//! use runtime::providers::{AnthropicAuth, AnthropicBackend};
//! use runtime::{
//!     builtin_tools, NullObserver, Orchestrator, Session, SessionConfig, ToolRegistry,
//! };
//! use std::sync::Arc;
//! use storage::EventStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> runtime::Result<()> {
//! let backend = AnthropicBackend::builder(AnthropicAuth::ApiKey("sk-ant-...".into())).build();
//! let registry = Arc::new(ToolRegistry::new(builtin_tools(), Vec::new()));
//! registry.load().await;
//!
//! let store = EventStore::in_memory()?;
//! let mut session = Session::new(store, SessionConfig::default())?;
//!
//! let orchestrator = Orchestrator::new(backend, registry);
//! let outcome = orchestrator
//!     .run_turn(&mut session, "Hello!", &NullObserver, &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod memory;
pub mod model;
mod orchestrator;
pub mod providers;
mod registry;
mod session;
pub mod tools;

pub use coordinator::{Coordinator, ToolInvocation};
pub use error::{Error, Result};
pub use memory::{FinishedTurn, Memory, MemoryError, NoopMemory};
pub use orchestrator::{NullObserver, Orchestrator, TurnObserver, TurnOutcome};
pub use registry::{RegistrySnapshot, ToolBinding, ToolRegistry};
pub use session::{DEFAULT_MODEL, Entry, Session, SessionConfig};
pub use tools::{LocalTool, ToolError, builtin_tools};
