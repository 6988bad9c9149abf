use thiserror::Error;

/// Errors from the model-stream boundary.
///
/// Unlike tool failures, which are folded back into the conversation as
/// results, any of these fails the current turn.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
