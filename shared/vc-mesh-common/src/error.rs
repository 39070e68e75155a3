//! Protocol Errors

use thiserror::Error;

/// Errors raised while encoding or decoding room protocol payloads.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload was not valid JSON or did not match any known message kind.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Topic template is missing the `{room}` placeholder.
    #[error("Topic template has no {{room}} placeholder: {0}")]
    InvalidTopicTemplate(String),
}

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
