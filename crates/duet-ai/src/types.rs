//! Core types for chat and speech requests

use serde::{Deserialize, Serialize};

/// The closed set of supported providers.
///
/// Selected once when a backend is resolved from a [`ModelConfig`]; nothing
/// re-branches on provider identity per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
        }
    }

    /// Get the environment variable name for this provider's API key
    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Default base URL for API calls
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
        }
    }
}

/// Model configuration for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider to use
    pub provider: ProviderKind,
    /// Model identifier (e.g., "gpt-4o-mini")
    pub model: String,
    /// Base URL override (for proxies and compatible servers)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Maximum tokens per response
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ModelConfig {
    /// Create a config with provider defaults
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }

    /// Effective base URL (override or provider default)
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

/// Roles in a chat request, as seen by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat-completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Ordered conversation history, already framed for the acting speaker
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
}

/// Voice configuration for narration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// TTS model identifier (e.g., "tts-1")
    #[serde(default = "default_tts_model")]
    pub model: String,
    /// Voice name (e.g., "alloy")
    pub voice: String,
    /// Playback speed multiplier
    #[serde(default)]
    pub speed: Option<f32>,
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

/// API keys for the provider set, with environment fallback.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

impl ApiKeys {
    /// Load keys from the standard environment variables
    pub fn from_env() -> Self {
        Self {
            openai: std::env::var(ProviderKind::OpenAi.api_key_env_var()).ok(),
            anthropic: std::env::var(ProviderKind::Anthropic.api_key_env_var()).ok(),
        }
    }

    /// Get the configured key for a provider, if any
    pub fn get(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::OpenAi => self.openai.as_deref(),
            ProviderKind::Anthropic => self.anthropic.as_deref(),
        }
    }
}
