//! Gemini implementation of the invoice LLM trait.
//!
//! Uses `generateContent` with a JSON response mime type so replies come
//! back as bare JSON objects.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ExtractionError, Result};
use crate::prompts::{extract_prompt, EXTRACT_SYSTEM_PROMPT};
use crate::retry::{retry, RetryPolicy};
use crate::traits::llm::InvoiceLlm;

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini client using direct API calls.
#[derive(Clone)]
pub struct GeminiExtractor {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    retry_policy: RetryPolicy,
}

// Request/Response types for the generateContent API

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: ContentPart,
    contents: Vec<ContentPart>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct ContentPart {
    parts: Vec<TextPart>,
}

#[derive(Serialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    response_mime_type: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GeminiExtractor {
    /// Create a new Gemini client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: SecretString::from(api_key.into()),
            model: "gemini-2.0-flash".to_string(),
            base_url: GEMINI_API_URL.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the model (default: gemini-2.0-flash).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set a custom base URL (for proxies and tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url,
            self.model,
            self.api_key.expose_secret()
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(60))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractionError::LlmUnavailable {
                provider: "gemini",
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Llm {
                provider: "gemini",
                message: format!("API error: {status} - {text}"),
            });
        }

        let body: GenerateResponse = response.json().await?;
        body.candidates
            .and_then(|mut c| c.drain(..).next())
            .and_then(|c| c.content)
            .and_then(|c| c.parts)
            .and_then(|mut p| p.drain(..).next())
            .and_then(|p| p.text)
            .ok_or_else(|| ExtractionError::UnparseableReply {
                provider: "gemini",
                reason: "empty candidates".to_string(),
            })
    }
}

#[async_trait]
impl InvoiceLlm for GeminiExtractor {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    async fn extract(&self, text: &str, prompt_version: &str) -> Result<String> {
        let request = GenerateRequest {
            system_instruction: ContentPart {
                parts: vec![TextPart {
                    text: EXTRACT_SYSTEM_PROMPT.to_string(),
                }],
            },
            contents: vec![ContentPart {
                parts: vec![TextPart {
                    text: extract_prompt(text, prompt_version),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: "application/json".to_string(),
            },
        };

        retry(&self.retry_policy, "gemini.generate", || {
            self.generate(&request)
        })
        .await
    }
}
