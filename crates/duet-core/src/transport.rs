//! Seam between the controller and the provider layer.

use async_trait::async_trait;
use duet_ai::{ApiKeys, ChatBackend, ChatRequest, TextChunkStream};

use crate::conversation::{AgentSlot, SessionConfig};
use crate::error::{Error, Result};

/// Streams chat completions for either agent seat.
///
/// The controller only ever talks to this trait; tests substitute scripted
/// implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn stream(
        &self,
        slot: AgentSlot,
        request: ChatRequest,
    ) -> duet_ai::Result<TextChunkStream>;
}

/// Production transport backed by one resolved provider per seat.
pub struct ProviderTransport {
    a: ChatBackend,
    b: ChatBackend,
}

impl ProviderTransport {
    /// Resolve both seats' backends up front. Credential or model problems
    /// surface here, before any generation is attempted, and are never
    /// retried.
    pub fn resolve(config: &SessionConfig, keys: &ApiKeys) -> Result<Self> {
        let backend = |slot: AgentSlot| {
            let model = &config.agent(slot).model;
            ChatBackend::resolve(model, keys.get(model.provider))
                .map_err(|e| Error::Config(format!("agent {}: {}", slot, e)))
        };
        Ok(Self {
            a: backend(AgentSlot::A)?,
            b: backend(AgentSlot::B)?,
        })
    }
}

#[async_trait]
impl Transport for ProviderTransport {
    async fn stream(
        &self,
        slot: AgentSlot,
        request: ChatRequest,
    ) -> duet_ai::Result<TextChunkStream> {
        match slot {
            AgentSlot::A => self.a.stream(&request).await,
            AgentSlot::B => self.b.stream(&request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::AgentConfig;
    use crate::retry::BackoffConfig;
    use duet_ai::{ModelConfig, ProviderKind};

    fn config_without_keys() -> SessionConfig {
        let agent = |name: &str| AgentConfig {
            name: name.to_string(),
            model: ModelConfig::new(ProviderKind::OpenAi, "gpt-4o-mini"),
            system_prompt: String::new(),
            voice: None,
        };
        SessionConfig {
            agent_a: agent("Ada"),
            agent_b: agent("Ben"),
            opening_prompt: None,
            language: None,
            first_turn: AgentSlot::A,
            lookahead_limit: 3,
            backoff: BackoffConfig::default(),
        }
    }

    #[test]
    fn test_resolves_with_keys() {
        let keys = ApiKeys {
            openai: Some("sk-test".into()),
            anthropic: None,
        };
        assert!(ProviderTransport::resolve(&config_without_keys(), &keys).is_ok());
    }
}
