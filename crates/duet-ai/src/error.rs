//! Error types for duet-ai

use thiserror::Error;

/// Result type alias using duet-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when interacting with chat or speech providers.
///
/// Callers are not expected to branch on the variant: the turn controller
/// treats every provider failure uniformly and only the message survives.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing audio data failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// API returned an error response
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// API key was not configured and not present in the environment
    #[error("missing API key for {0}")]
    MissingApiKey(&'static str),

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// Unexpected response format
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Request was aborted by the caller
    #[error("request aborted")]
    Aborted,
}
