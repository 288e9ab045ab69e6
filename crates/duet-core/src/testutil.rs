//! Shared fixtures for the crate's tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use duet_ai::{ChatRequest, ModelConfig, ProviderKind, TextChunkStream, VoiceConfig};

use crate::conversation::{AgentConfig, AgentSlot, SessionConfig};
use crate::retry::BackoffConfig;
use crate::transport::Transport;

/// Scripted transport: each call pops the next scripted item. `Ok` text is
/// streamed word by word; `Err` fails the call.
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicU32,
    delay: Option<Duration>,
    pub(crate) requests: Mutex<Vec<(AgentSlot, ChatRequest)>>,
}

impl MockTransport {
    fn build(items: Vec<Result<&str, &str>>, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(
                items
                    .into_iter()
                    .map(|r| r.map(String::from).map_err(String::from))
                    .collect(),
            ),
            calls: AtomicU32::new(0),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn scripted(items: Vec<Result<&str, &str>>) -> Arc<Self> {
        Self::build(items, None)
    }

    pub(crate) fn with_delay(items: Vec<Result<&str, &str>>, delay: Duration) -> Arc<Self> {
        Self::build(items, Some(delay))
    }

    pub(crate) fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn stream(
        &self,
        slot: AgentSlot,
        request: ChatRequest,
    ) -> duet_ai::Result<TextChunkStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((slot, request));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.script.lock().pop_front() {
            Some(Ok(text)) => {
                let chunks: Vec<String> = text.split_inclusive(' ').map(String::from).collect();
                Ok(Box::pin(async_stream::stream! {
                    for chunk in chunks {
                        yield Ok(chunk);
                    }
                }))
            }
            Some(Err(message)) => Err(duet_ai::Error::Api {
                status: 500,
                message,
            }),
            None => Err(duet_ai::Error::UnexpectedResponse(
                "mock script exhausted".into(),
            )),
        }
    }
}

pub(crate) fn voice() -> VoiceConfig {
    VoiceConfig {
        model: "tts-1".into(),
        voice: "alloy".into(),
        speed: None,
    }
}

pub(crate) fn agent(name: &str, narrated: bool) -> AgentConfig {
    AgentConfig {
        name: name.to_string(),
        model: ModelConfig::new(ProviderKind::OpenAi, "gpt-4o-mini"),
        system_prompt: format!("You are {}.", name),
        voice: narrated.then(voice),
    }
}

pub(crate) fn test_config(narrated: bool) -> SessionConfig {
    SessionConfig {
        agent_a: agent("Ada", narrated),
        agent_b: agent("Ben", narrated),
        opening_prompt: None,
        language: None,
        first_turn: AgentSlot::A,
        lookahead_limit: 3,
        backoff: BackoffConfig::default(),
    }
}
