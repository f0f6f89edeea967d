//! OpenAI implementation of the invoice LLM trait.
//!
//! The configured fallback provider: chat completions with
//! `response_format: json_object` so replies come back as bare JSON.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ExtractionError, Result};
use crate::prompts::{extract_prompt, EXTRACT_SYSTEM_PROMPT};
use crate::retry::{retry, RetryPolicy};
use crate::traits::llm::InvoiceLlm;

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// OpenAI client using direct API calls.
#[derive(Clone)]
pub struct OpenAiExtractor {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    retry_policy: RetryPolicy,
}

// Request/Response types for the chat completions API

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
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

impl OpenAiExtractor {
    /// Create a new OpenAI client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: SecretString::from(api_key.into()),
            model: "gpt-4o-mini".to_string(),
            base_url: OPENAI_API_URL.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the chat model (default: gpt-4o-mini).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL (for Azure, proxies, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(60))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractionError::LlmUnavailable {
                provider: "openai",
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Llm {
                provider: "openai",
                message: format!("API error: {status} - {text}"),
            });
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ExtractionError::UnparseableReply {
                provider: "openai",
                reason: "empty choices".to_string(),
            })
    }
}

#[async_trait]
impl InvoiceLlm for OpenAiExtractor {
    fn provider(&self) -> &'static str {
        "openai"
    }

    async fn extract(&self, text: &str, prompt_version: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACT_SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: extract_prompt(text, prompt_version),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        retry(&self.retry_policy, "openai.chat", || self.chat(&request)).await
    }
}
