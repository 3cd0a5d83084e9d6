//! Error types for payload decoding.

/// A message payload that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload has no `value` field")]
    MissingValue,
}
