//! Narration synthesis, decoupled from turn progression.
//!
//! Synthesis runs on its own task after a gated turn is durable. A synthesis
//! failure only logs a warning: the gate is owned by playback acknowledgement,
//! not by synthesis, so the conversation stays releasable either way.

use async_trait::async_trait;
use duet_ai::VoiceConfig;
use std::sync::Arc;

use crate::conversation::{ConversationId, MessageId};
use crate::live::{LiveChannel, LiveEvent};
use crate::store::ConversationStore;

/// Result of synthesizing one message
#[derive(Debug, Clone)]
pub struct NarrationAudio {
    /// Opaque reference to the stored audio (a path or URL)
    pub audio_ref: String,
    /// Whether the text exceeded the synthesis input limit and was split
    pub was_split: bool,
}

/// Turns message text into stored audio.
#[async_trait]
pub trait Narrator: Send + Sync {
    async fn narrate(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        text: &str,
        voice: &VoiceConfig,
    ) -> duet_ai::Result<NarrationAudio>;
}

/// Synthesize narration for a durable message in the background.
pub(crate) fn spawn_synthesis(
    narrator: Arc<dyn Narrator>,
    store: Arc<dyn ConversationStore>,
    live: LiveChannel,
    conversation_id: ConversationId,
    message_id: MessageId,
    text: String,
    voice: VoiceConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match narrator
            .narrate(conversation_id, message_id, &text, &voice)
            .await
        {
            Ok(audio) => {
                if let Err(e) = store
                    .attach_narration(
                        conversation_id,
                        message_id,
                        audio.audio_ref.clone(),
                        audio.was_split,
                    )
                    .await
                {
                    tracing::warn!(
                        conversation = %conversation_id,
                        message = %message_id,
                        "failed to record narration: {}",
                        e
                    );
                    return;
                }
                live.publish(LiveEvent::NarrationReady {
                    message_id,
                    audio_ref: audio.audio_ref,
                });
            }
            Err(e) => {
                tracing::warn!(
                    conversation = %conversation_id,
                    message = %message_id,
                    "narration synthesis failed: {}",
                    e
                );
            }
        }
    })
}
