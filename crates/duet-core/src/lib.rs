//! duet-core: turn orchestration and playback gating for two-agent
//! conversations.
//!
//! The crate drives a persisted session in which two independently
//! configured agents speak in alternation, optionally holding each turn open
//! until narration of the previous turn has finished playing, while bounding
//! how far generation may run ahead of playback.

pub mod controller;
pub mod conversation;
pub mod error;
pub mod handle;
pub mod live;
pub mod lookahead;
pub mod narration;
pub mod orchestrator;
pub mod resume;
pub mod retry;
pub mod session;
pub mod store;
#[cfg(test)]
pub(crate) mod testutil;
pub mod transport;

pub use controller::{IgnoreReason, TurnController, Wake, WakeOutcome};
pub use conversation::{
    AgentConfig, AgentSlot, Conversation, ConversationId, DraftPhase, MessageId, NewMessage,
    SessionConfig, Speaker, Status, StoredMessage, StreamingDraft,
};
pub use error::{Error, Result};
pub use handle::SessionHandle;
pub use live::{LiveChannel, LiveEvent};
pub use narration::{NarrationAudio, Narrator};
pub use orchestrator::Orchestrator;
pub use resume::{ResumeCoordinator, ResumeOutcome};
pub use retry::{BackoffConfig, RetryError, RetrySupervisor};
pub use session::SessionActor;
pub use store::{ConversationPatch, ConversationStore, MemoryStore, Precondition, StoreError};
pub use transport::{ProviderTransport, Transport};
