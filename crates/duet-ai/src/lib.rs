//! duet-ai: chat-completion and text-to-speech provider adapters
//!
//! This crate provides a uniform interface for invoking chat models (single
//! result or token stream) and synthesizing speech, behind a closed set of
//! provider backends resolved once at configuration time.

pub mod error;
pub mod providers;
pub mod speech;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use providers::ChatBackend;
pub use speech::SpeechBackend;
pub use stream::TextChunkStream;
pub use types::*;
