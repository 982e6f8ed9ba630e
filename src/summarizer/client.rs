use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::OpsError;

/// Everything one chat-completion call needs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub endpoint: String,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub timeout: Duration,
}

impl CompletionRequest {
    pub fn from_config(config: &LlmConfig, user_prompt: String) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            user_prompt,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn body(&self) -> ChatRequest<'_> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &self.user_prompt,
                },
            ],
            temperature: self.temperature,
            stream: false,
            max_tokens: u64::try_from(self.max_tokens).ok(),
        }
    }
}

/// A single blocking text completion.
pub trait CompletionClient {
    fn complete(&self, request: &CompletionRequest) -> Result<String, OpsError>;
}

/// OpenAI-compatible `chat/completions` endpoint over HTTP.
#[derive(Debug, Default)]
pub struct HttpCompletionClient;

impl CompletionClient for HttpCompletionClient {
    fn complete(&self, request: &CompletionRequest) -> Result<String, OpsError> {
        if request.endpoint.trim().is_empty() {
            return Err(OpsError::llm("no endpoint configured"));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(request.timeout)
            .build()
            .map_err(OpsError::llm)?;

        debug!(endpoint = %request.endpoint, model = %request.model, "sending completion request");
        let response = client
            .post(&request.endpoint)
            .header("Content-Type", "application/json")
            .json(&request.body())
            .send()
            .map_err(OpsError::llm)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(OpsError::llm(format!("API error ({status}): {text}")));
        }
        let parsed: ChatResponse = response
            .json()
            .map_err(|e| OpsError::llm(format!("Failed to parse response: {e}")))?;
        parsed.assistant_content()
    }
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: ResponseMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    /// First non-empty assistant message.
    pub fn assistant_content(&self) -> Result<String, OpsError> {
        self.choices
            .iter()
            .map(|choice| &choice.message)
            .filter(|message| message.role.is_empty() || message.role == "assistant")
            .filter_map(|message| message.content.as_deref())
            .map(str::trim)
            .find(|content| !content.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| OpsError::llm("response did not contain summary content"))
    }
}
