//! Provider adapters for the model-stream contract.
//!
//! Each adapter translates [`crate::model`] types to one provider's wire
//! format and decodes its incremental response into [`StreamEvent`]s.
//!
//! [`StreamEvent`]: crate::model::StreamEvent

mod anthropic;

pub use anthropic::{AnthropicAuth, AnthropicBackend, AnthropicBackendBuilder};
