use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, error, warn};

use super::config::ChatClientConfig;
use super::messages::{ChatCompletionChunk, ChatCompletionRequest, ChatMessage};
use super::sse::{SseDecoder, SseEvent};
use crate::core::llm::{ChatContext, ChatError, ChatStreamer, TextDeltaStream};
use crate::core::openai::describe_error;

/// Streams `choices[0].delta.content` from an OpenAI-compatible endpoint
pub struct OpenAICompatChat {
    http_client: Client,
    config: ChatClientConfig,
}

impl OpenAICompatChat {
    pub fn new(config: ChatClientConfig) -> Result<Self, ChatError> {
        config.validate().map_err(ChatError::ConfigurationError)?;

        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| {
                ChatError::ConfigurationError(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &ChatClientConfig {
        &self.config
    }

    fn model_for(&self, context: &ChatContext) -> &str {
        if context.image.is_some() {
            &self.config.vlm_model
        } else {
            &self.config.model
        }
    }
}

#[async_trait]
impl ChatStreamer for OpenAICompatChat {
    async fn stream_chat(&self, context: ChatContext) -> Result<TextDeltaStream, ChatError> {
        let body = ChatCompletionRequest {
            model: self.model_for(&context),
            messages: ChatMessage::from_context(&context),
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut request = self
            .http_client
            .post(self.config.api_url())
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChatError::NetworkError(format!("Request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = describe_error(status, &text);
            error!(status = %status, "Chat completion request failed");
            return Err(match status.as_u16() {
                401 | 403 => ChatError::AuthenticationFailed(message),
                _ => ChatError::ProviderError(message),
            });
        }

        debug!(model = %body.model, "Chat stream opened");

        let mut bytes = Box::pin(response.bytes_stream());
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            let mut done = false;

            while !done {
                let events = match bytes.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => {
                        yield Err(ChatError::StreamError(format!("Body read failed: {e}")));
                        return;
                    }
                    None => {
                        done = true;
                        decoder.finish().into_iter().collect()
                    }
                };

                for event in events {
                    match event {
                        SseEvent::Done => {
                            done = true;
                            break;
                        }
                        SseEvent::Data(data) => {
                            let parsed: ChatCompletionChunk = match serde_json::from_str(&data) {
                                Ok(parsed) => parsed,
                                Err(e) => {
                                    warn!("Skipping unparseable chat chunk: {}", e);
                                    continue;
                                }
                            };
                            if let Some(content) = parsed.content()
                                && !content.is_empty()
                            {
                                yield Ok(content.to_string());
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
