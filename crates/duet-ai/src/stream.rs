//! Streaming text chunks

use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::Result;

/// A stream of incremental text deltas from a chat completion.
pub type TextChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;
