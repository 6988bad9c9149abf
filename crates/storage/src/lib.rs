//! SQLite-backed event storage for Helmsman sessions.
//!
//! Every message, tool call, tool result, and turn boundary is appended to a
//! per-session event log, giving a complete audit trail of what the agent did
//! and why. The log is what `helmsman sessions` and `helmsman logs` read.
//!
//! # Example
//!
//! ```no_run
//! use storage::{Event, EventKind, EventStore, Role, SessionId};
//!
//! let store = EventStore::open("events.db")?;
//!
//! let session_id = SessionId::new();
//! store.append(&Event::new(session_id, EventKind::SessionStart))?;
//! store.append(&Event::message(session_id, Role::User, "Hello!"))?;
//!
//! for event in store.load_session(session_id)? {
//!     println!("{}: {:?}", event.timestamp, event.kind);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod error;
mod event;
mod store;

pub use error::{Error, Result};
pub use event::{Event, EventKind, Role, SessionId};
pub use store::{EventStore, SessionSummary};
