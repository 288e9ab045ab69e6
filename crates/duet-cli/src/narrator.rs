//! Narration backed by the speech API, written to local MP3 files.

use async_trait::async_trait;
use std::path::PathBuf;

use duet_ai::speech::{MAX_TTS_INPUT_CHARS, SpeechBackend, split_for_narration};
use duet_ai::VoiceConfig;
use duet_core::{ConversationId, MessageId, NarrationAudio, Narrator};

/// Synthesizes each message into one MP3 under `out_dir`. Oversized messages
/// are split at sentence boundaries and the parts concatenated; MP3 frames
/// are self-contained, so plain concatenation plays back fine.
pub struct FileNarrator {
    speech: SpeechBackend,
    out_dir: PathBuf,
}

impl FileNarrator {
    pub fn new(speech: SpeechBackend, out_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)?;
        Ok(Self { speech, out_dir })
    }
}

#[async_trait]
impl Narrator for FileNarrator {
    async fn narrate(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        text: &str,
        voice: &VoiceConfig,
    ) -> duet_ai::Result<NarrationAudio> {
        let parts = split_for_narration(text, MAX_TTS_INPUT_CHARS);
        let was_split = parts.len() > 1;

        let mut bytes = Vec::new();
        for part in &parts {
            bytes.extend_from_slice(&self.speech.synthesize(part, voice).await?);
        }

        let path = self
            .out_dir
            .join(format!("{}-{}.mp3", conversation_id, message_id));
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(message = %message_id, path = %path.display(), "narration written");

        Ok(NarrationAudio {
            audio_ref: path.display().to_string(),
            was_split,
        })
    }
}
