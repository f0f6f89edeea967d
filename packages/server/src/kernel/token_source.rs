//! Metadata-server token source for serverless deployments.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Mutex;

use extraction::error::{ExtractionError, Result};
use extraction::TokenSource;

const METADATA_BASE_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default";

/// Expire cached tokens a minute early.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Fetches tokens from the serving platform's metadata endpoint.
pub struct MetadataTokenSource {
    client: Client,
    base_url: String,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl Default for MetadataTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataTokenSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: METADATA_BASE_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    /// Set a custom base URL (for tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn fetch(&self, path: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Metadata-Flavor", "Google")
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExtractionError::Token(format!(
                "metadata server returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn access_token(&self) -> Result<String> {
        if let Some((token, expires_at)) = self.cached.lock().unwrap().clone() {
            if Utc::now() < expires_at {
                return Ok(token);
            }
        }

        let body: TokenResponse = self.fetch("/token").await?.json().await?;
        let expires_at =
            Utc::now() + Duration::seconds((body.expires_in - EXPIRY_SLACK_SECS).max(0));
        *self.cached.lock().unwrap() = Some((body.access_token.clone(), expires_at));
        Ok(body.access_token)
    }

    async fn identity_token(&self, audience: &str) -> Result<String> {
        let response = self
            .fetch(&format!("/identity?audience={audience}&format=full"))
            .await?;
        Ok(response.text().await?.trim().to_string())
    }
}
