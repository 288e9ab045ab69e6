//! OpenAI Chat Completions API provider

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    stream::TextChunkStream,
    types::{ChatRequest, ChatRole, ModelConfig},
};

/// OpenAI chat client
pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    config: ModelConfig,
}

impl OpenAiChat {
    /// Create a new OpenAI chat client
    pub fn new(api_key: impl Into<String>, config: ModelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url())
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(ref system_prompt) = request.system_prompt {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system_prompt.clone(),
            });
        }

        for msg in &request.messages {
            messages.push(WireMessage {
                role: match msg.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                },
                content: msg.content.clone(),
            });
        }

        WireRequest {
            model: self.config.model.clone(),
            messages,
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    /// Invoke the model and wait for the full response
    pub async fn invoke(&self, request: &ChatRequest) -> Result<String> {
        let body = self.build_body(request, false);

        let response = self
            .client
            .post(self.endpoint())
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

        let completion: Completion = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::UnexpectedResponse("completion without content".to_string()))
    }

    /// Stream incremental text deltas from the model
    pub async fn stream(&self, request: &ChatRequest) -> Result<TextChunkStream> {
        let body = self.build_body(request, true);
        tracing::debug!(
            model = %self.config.model,
            messages = body.messages.len(),
            "streaming chat completion"
        );

        let request_builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("failed to create event source: {}", e)))?;

        Ok(Box::pin(chunk_stream(event_source)))
    }
}

fn chunk_stream(mut event_source: EventSource) -> impl futures::Stream<Item = Result<String>> {
    stream! {
        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }
                    match serde_json::from_str::<StreamChunk>(&msg.data) {
                        Ok(chunk) => {
                            for choice in chunk.choices {
                                if let Some(content) = choice.delta.content {
                                    if !content.is_empty() {
                                        yield Ok(content);
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(Error::Sse(format!("failed to parse chunk: {}", e)));
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
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    content: Option<String>,
}
