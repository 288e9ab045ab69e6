//! Text-to-speech synthesis

use serde::Serialize;

use crate::{
    error::{Error, Result},
    types::{ProviderKind, VoiceConfig},
};

/// Maximum input length accepted by the speech endpoint per request.
pub const MAX_TTS_INPUT_CHARS: usize = 4096;

/// A resolved speech backend, selected once at configuration time.
pub enum SpeechBackend {
    OpenAi(OpenAiSpeech),
}

impl SpeechBackend {
    /// Resolve the speech backend.
    ///
    /// `api_key` takes precedence; otherwise the provider's environment
    /// variable is consulted.
    pub fn resolve(api_key: Option<&str>) -> Result<Self> {
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var(ProviderKind::OpenAi.api_key_env_var()).ok())
            .ok_or(Error::MissingApiKey(ProviderKind::OpenAi.name()))?;
        Ok(SpeechBackend::OpenAi(OpenAiSpeech::new(key)))
    }

    /// Synthesize speech for one chunk of text, returning encoded audio bytes.
    pub async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Vec<u8>> {
        match self {
            SpeechBackend::OpenAi(p) => p.synthesize(text, voice).await,
        }
    }
}

/// OpenAI speech client
pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiSpeech {
    /// Create a new speech client
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: ProviderKind::OpenAi.default_base_url().to_string(),
        }
    }

    /// Override the base URL (for proxies and compatible servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Synthesize speech, returning MP3 bytes
    pub async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Vec<u8>> {
        let body = SpeechRequest {
            model: &voice.model,
            input: text,
            voice: &voice.voice,
            speed: voice.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    response_format: &'a str,
}

/// Split text into chunks each at most `max_chars` long, preferring sentence
/// boundaries. Text that fits in one chunk is returned unchanged.
pub fn split_for_narration(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return vec![];
    }
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in split_sentences(text) {
        let sentence_len = sentence.chars().count();
        if current_len + sentence_len > max_chars && !current.is_empty() {
            chunks.push(current.trim().to_string());
            current = String::new();
            current_len = 0;
        }
        if sentence_len > max_chars {
            // A single run-on sentence still has to fit the request limit.
            for piece in hard_split(sentence, max_chars) {
                chunks.push(piece);
            }
            continue;
        }
        current.push_str(sentence);
        current_len += sentence_len;
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks
}

/// Split text after sentence-ending punctuation or newlines, keeping the
/// terminator with the preceding sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut prev_end = false;

    for (idx, ch) in text.char_indices() {
        let is_end = matches!(ch, '.' | '!' | '?' | '\n');
        if prev_end && !is_end {
            sentences.push(&text[start..idx]);
            start = idx;
        }
        prev_end = is_end;
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
