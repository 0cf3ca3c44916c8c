use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::config::AgentConfig;
use crate::error::AgentError;

/// An external reasoning agent that proposes fixes.
///
/// One consultation is a single request/response exchange: a structured
/// prompt goes out, free text (expected to contain JSON) comes back.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningAgent: Send + Sync {
    /// Stable identity used to attribute proposals
    fn id(&self) -> String;

    async fn consult(&self, prompt: &str) -> Result<String, AgentError>;
}

const SYSTEM_PROMPT: &str = "You are a senior engineer repairing a running web application. \
Respond with a single JSON object inside a ```json fenced block and nothing else.";

/// Reasoning agent backed by an Anthropic-compatible messages API
pub struct LlmAgent {
    id: String,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    content: Vec<ContentBlock>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorDetail>,
    msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl LlmAgent {
    pub fn new(
        id: &str,
        base_url: &str,
        api_key: &str,
        model: &str,
        max_tokens: u32,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            id: id.to_string(),
            client: Client::builder().timeout(Duration::from_secs(120)).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        })
    }

    /// Build an agent from config, reading the API key from the environment
    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            AgentError::Unavailable(format!("{} is not set", config.api_key_env))
        })?;
        Self::new(
            &config.id,
            &config.base_url,
            &api_key,
            &config.model,
            config.max_tokens,
        )
    }

    fn extract_text(response: ChatResponse) -> String {
        response
            .content
            .into_iter()
            .filter(|block| block.content_type == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl ReasoningAgent for LlmAgent {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn consult(&self, prompt: &str) -> Result<String, AgentError> {
        let url = format!("{}/v1/messages", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        info!(
            agent = %self.id,
            model = %self.model,
            prompt_length = prompt.len(),
            "consulting reasoning agent"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .and_then(|err| err.msg.or_else(|| err.error.and_then(|e| e.message)))
                .unwrap_or(body);
            return Err(AgentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| AgentError::Malformed(e.to_string()))?;

        if let Some(usage) = &chat_response.usage {
            info!(
                agent = %self.id,
                model = chat_response.model.as_deref().unwrap_or(&self.model),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "agent response received"
            );
        }

        Ok(Self::extract_text(chat_response))
    }
}
