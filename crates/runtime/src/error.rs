use crate::model::ModelError;
use thiserror::Error;

/// Failures of the orchestration machinery itself.
///
/// Tool-level failures never appear here; they are folded back into the
/// conversation as results. An `Error` terminates the current turn and leaves
/// the session at its last consistent state.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error("turn cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
