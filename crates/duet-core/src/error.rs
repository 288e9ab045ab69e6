//! Error taxonomy for the turn controller.

use thiserror::Error;

use crate::{conversation::AgentSlot, conversation::ConversationId, store::StoreError};

/// Result type alias using duet-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a conversation
#[derive(Error, Debug)]
pub enum Error {
    /// Provider retries exhausted; the conversation transitions to `Erred`
    #[error("agent {slot} generation failed after {attempts} attempts: {message}")]
    Generation {
        slot: AgentSlot,
        attempts: u32,
        message: String,
    },

    /// Unusable configuration (unknown model, missing credential).
    /// Immediately terminal; retrying cannot help.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A conditional update lost a race even after re-reading fresh state
    #[error("conversation state changed concurrently")]
    Conflict,

    /// No live session is attached to the conversation
    #[error("conversation {0} has no active session")]
    Inactive(ConversationId),

    /// The durable store failed; the controller cannot make progress
    #[error(transparent)]
    Store(#[from] StoreError),
}
