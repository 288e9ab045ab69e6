//! Anthropic Messages API provider

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    stream::TextChunkStream,
    types::{ChatRequest, ChatRole, ModelConfig},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Text used to open the history when it would otherwise start with an
/// assistant turn; the Messages API requires a leading user message.
const SEED_USER_TEXT: &str = "(The conversation begins.)";

/// Anthropic chat client
pub struct AnthropicChat {
    client: reqwest::Client,
    api_key: String,
    config: ModelConfig,
}

impl AnthropicChat {
    /// Create a new Anthropic chat client
    pub fn new(api_key: impl Into<String>, config: ModelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url())
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: self.config.model.clone(),
            system: request.system_prompt.clone(),
            messages: frame_messages(request),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            stream,
        }
    }

    fn request_builder(&self, body: &WireRequest) -> reqwest::RequestBuilder {
        self.client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    /// Invoke the model and wait for the full response
    pub async fn invoke(&self, request: &ChatRequest) -> Result<String> {
        let body = self.build_body(request, false);
        let response = self.request_builder(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let message: WireResponse = response.json().await?;
        let text: String = message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
            })
            .collect();
        Ok(text)
    }

    /// Stream incremental text deltas from the model
    pub async fn stream(&self, request: &ChatRequest) -> Result<TextChunkStream> {
        let body = self.build_body(request, true);
        tracing::debug!(
            model = %self.config.model,
            messages = body.messages.len(),
            "streaming message"
        );

        let event_source = EventSource::new(self.request_builder(&body))
            .map_err(|e| Error::Sse(format!("failed to create event source: {}", e)))?;

        Ok(Box::pin(chunk_stream(event_source)))
    }
}

/// Adapt controller-framed history to the Messages API shape: the history
/// must open with a user turn and roles must alternate, so consecutive
/// same-role messages are merged.
fn frame_messages(request: &ChatRequest) -> Vec<WireMessage> {
    let mut out: Vec<WireMessage> = Vec::with_capacity(request.messages.len() + 1);

    for msg in &request.messages {
        let role = match msg.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&msg.content);
            }
            _ => out.push(WireMessage {
                role: role.to_string(),
                content: msg.content.clone(),
            }),
        }
    }

    if out.first().is_none_or(|m| m.role != "user") {
        out.insert(
            0,
            WireMessage {
                role: "user".to_string(),
                content: SEED_USER_TEXT.to_string(),
            },
        );
    }

    out
}

fn chunk_stream(mut event_source: EventSource) -> impl futures::Stream<Item = Result<String>> {
    stream! {
        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    match serde_json::from_str::<StreamEvent>(&msg.data) {
                        Ok(StreamEvent::ContentBlockDelta { delta }) => {
                            if let BlockDelta::TextDelta { text } = delta {
                                if !text.is_empty() {
                                    yield Ok(text);
                                }
                            }
                        }
                        Ok(StreamEvent::MessageStop) => break,
                        Ok(StreamEvent::Error { error }) => {
                            yield Err(Error::Api { status: 0, message: error.message });
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            yield Err(Error::Sse(format!("failed to parse event: {}", e)));
                            return;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart,
    ContentBlockStart,
    ContentBlockDelta { delta: BlockDelta },
    ContentBlockStop,
    MessageDelta,
    MessageStop,
    Ping,
    Error { error: ApiError },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}
