//! Completion service: turns a reduced context into reply text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chatbot::error::BotError;
use crate::chatbot::message::{ChatMessage, MessageKind};
use crate::config::CompletionConfig;

#[async_trait]
pub trait Completion: Send + Sync {
    /// Reply text for a reduced context (directive first, oldest to newest).
    async fn complete(&self, context: &[ChatMessage]) -> Result<String, BotError>;

    /// Reply text for a one-off instruction, e.g. a greeting.
    async fn custom_response(&self, persona_directive: &str, instruction: &str) -> Result<String, BotError>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionClient {
    config: CompletionConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatCompletionClient {
    pub fn new(config: CompletionConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn send(&self, messages: Vec<ApiMessage>) -> Result<String, BotError> {
        let request = ApiRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages,
        };

        let mut builder = self.http.post(&self.config.endpoint).json(&request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BotError::Completion(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Completion(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| BotError::Completion(format!("bad response: {e}")))?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BotError::Completion("empty response".to_string()))?;

        debug!("Completion returned {} chars", text.len());
        Ok(text)
    }
}

/// Map history onto chat roles. User turns carry the sender, escaped.
fn to_api_messages(context: &[ChatMessage]) -> Vec<ApiMessage> {
    context
        .iter()
        .map(|m| match m.kind {
            MessageKind::System => ApiMessage {
                role: "system",
                content: m.text.clone(),
            },
            MessageKind::BotOwn => ApiMessage {
                role: "assistant",
                content: m.text.clone(),
            },
            MessageKind::User => ApiMessage {
                role: "user",
                content: m.format(),
            },
        })
        .collect()
}

#[async_trait]
impl Completion for ChatCompletionClient {
    async fn complete(&self, context: &[ChatMessage]) -> Result<String, BotError> {
        self.send(to_api_messages(context)).await
    }

    async fn custom_response(&self, persona_directive: &str, instruction: &str) -> Result<String, BotError> {
        self.send(vec![
            ApiMessage {
                role: "system",
                content: persona_directive.to_string(),
            },
            ApiMessage {
                role: "user",
                content: instruction.to_string(),
            },
        ])
        .await
    }
}
