//! Chat providers behind a closed backend set

pub mod anthropic;
pub mod openai;

use crate::{
    error::{Error, Result},
    stream::TextChunkStream,
    types::{ChatRequest, ModelConfig, ProviderKind},
};

/// A resolved chat backend.
///
/// Resolution happens once, when a session is configured; a missing API key
/// or unusable model surfaces here and is never retried.
pub enum ChatBackend {
    OpenAi(openai::OpenAiChat),
    Anthropic(anthropic::AnthropicChat),
}

impl ChatBackend {
    /// Resolve a backend for a model config.
    ///
    /// `api_key` takes precedence; otherwise the provider's environment
    /// variable is consulted.
    pub fn resolve(config: &ModelConfig, api_key: Option<&str>) -> Result<Self> {
        let key = api_key
            .map(str::to_string)
            .or_else(|| std::env::var(config.provider.api_key_env_var()).ok())
            .ok_or(Error::MissingApiKey(config.provider.name()))?;

        Ok(match config.provider {
            ProviderKind::OpenAi => {
                ChatBackend::OpenAi(openai::OpenAiChat::new(key, config.clone()))
            }
            ProviderKind::Anthropic => {
                ChatBackend::Anthropic(anthropic::AnthropicChat::new(key, config.clone()))
            }
        })
    }

    /// Invoke the model and wait for the full response text.
    pub async fn invoke(&self, request: &ChatRequest) -> Result<String> {
        match self {
            ChatBackend::OpenAi(p) => p.invoke(request).await,
            ChatBackend::Anthropic(p) => p.invoke(request).await,
        }
    }

    /// Invoke the model and stream incremental text deltas.
    pub async fn stream(&self, request: &ChatRequest) -> Result<TextChunkStream> {
        match self {
            ChatBackend::OpenAi(p) => p.stream(request).await,
            ChatBackend::Anthropic(p) => p.stream(request).await,
        }
    }
}
