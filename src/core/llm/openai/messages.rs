//! Request and streaming-chunk bodies for `chat/completions`.

use serde::{Deserialize, Serialize};

use crate::core::llm::ChatContext;

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    /// System prompt followed by the user turn. A multimodal turn becomes an
    /// image part plus a text part.
    pub fn from_context(context: &ChatContext) -> Vec<ChatMessage> {
        let user_content = match &context.image {
            None => MessageContent::Text(context.user_message.clone()),
            Some(image) => MessageContent::Parts(vec![
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image.to_url(),
                    },
                },
                ContentPart::Text {
                    text: context.user_message.clone(),
                },
            ]),
        };

        let mut messages = Vec::with_capacity(2);
        if !context.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: MessageContent::Text(context.system_prompt.clone()),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_content,
        });
        messages
    }
}

/// One `data:` payload of the stream
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
    }
}
