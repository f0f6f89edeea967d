//! Vision API client using direct HTTP calls.
//!
//! Two tiers: `files:annotate` with inline content for short PDFs, and
//! `files:asyncBatchAnnotate` for long ones. The async tier writes JSON
//! output shards to the configured bucket; the caller collects them via its
//! blob gateway once the operation reports done.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExtractionError, Result};
use crate::retry::{retry, RetryPolicy};
use crate::traits::auth::TokenSource;
use crate::traits::ocr::OcrProvider;
use crate::types::ocr::{OcrOperation, OcrPoll, OcrText};

const VISION_API_URL: &str = "https://vision.googleapis.com/v1";

/// Vision OCR client.
pub struct VisionOcr {
    client: Client,
    tokens: Arc<dyn TokenSource>,
    bucket: String,
    language_hints: Vec<String>,
    base_url: String,
    retry_policy: RetryPolicy,
}

// Request/Response types for the Vision API

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateRequest {
    requests: Vec<FileRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileRequest {
    input_config: InputConfig,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_config: Option<OutputConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gcs_source: Option<GcsSource>,
    mime_type: &'static str,
}

#[derive(Serialize)]
struct GcsSource {
    uri: String,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputConfig {
    gcs_destination: GcsDestination,
    batch_size: u32,
}

#[derive(Serialize)]
struct GcsDestination {
    uri: String,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    responses: Option<Vec<FileResponse>>,
}

#[derive(Deserialize)]
struct FileResponse {
    responses: Option<Vec<PageResponse>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse {
    full_text_annotation: Option<FullTextAnnotation>,
}

#[derive(Deserialize)]
struct FullTextAnnotation {
    text: Option<String>,
    pages: Option<Vec<AnnotatedPage>>,
}

#[derive(Deserialize)]
struct AnnotatedPage {
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct OperationStart {
    name: String,
}

#[derive(Deserialize)]
struct OperationStatus {
    done: Option<bool>,
    error: Option<OperationError>,
}

#[derive(Deserialize)]
struct OperationError {
    message: Option<String>,
}

/// Extract the recognized text from one async-tier output shard.
///
/// Shards are JSON files of the same response shape as the sync tier,
/// written by the provider under the submitted output prefix.
pub fn shard_text(shard: &[u8]) -> Result<String> {
    let parsed: FileResponse = serde_json::from_slice(shard)?;
    Ok(parsed
        .responses
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.full_text_annotation)
        .filter_map(|a| a.text)
        .collect::<Vec<_>>()
        .join("\n"))
}

impl VisionOcr {
    pub fn new(tokens: Arc<dyn TokenSource>, bucket: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            tokens,
            bucket: bucket.into(),
            language_hints: Vec::new(),
            base_url: VISION_API_URL.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Regional language hints (e.g. `["en", "nl", "de"]`).
    pub fn with_language_hints(mut self, hints: Vec<String>) -> Self {
        self.language_hints = hints;
        self
    }

    /// Set a custom base URL (for tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn image_context(&self) -> Option<ImageContext> {
        (!self.language_hints.is_empty()).then(|| ImageContext {
            language_hints: self.language_hints.clone(),
        })
    }

    fn gs_uri(&self, path: &str) -> String {
        format!("gs://{}/{}", self.bucket, path)
    }

    async fn post<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(120))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Ocr(
                format!("Vision API error: {status} - {text}").into(),
            ));
        }

        Ok(response.json().await?)
    }

    async fn get<R: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<R> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {token}"))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Ocr(
                format!("Vision API error: {status} - {text}").into(),
            ));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl OcrProvider for VisionOcr {
    async fn recognize(&self, pdf_bytes: &[u8]) -> Result<OcrText> {
        let request = AnnotateRequest {
            requests: vec![FileRequest {
                input_config: InputConfig {
                    content: Some(base64::engine::general_purpose::STANDARD.encode(pdf_bytes)),
                    gcs_source: None,
                    mime_type: "application/pdf",
                },
                features: vec![Feature {
                    feature_type: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context: self.image_context(),
                output_config: None,
            }],
        };

        let response: AnnotateResponse = retry(&self.retry_policy, "vision.annotate", || {
            self.post("/files:annotate", &request)
        })
        .await?;

        let pages: Vec<FullTextAnnotation> = response
            .responses
            .unwrap_or_default()
            .into_iter()
            .flat_map(|f| f.responses.unwrap_or_default())
            .filter_map(|p| p.full_text_annotation)
            .collect();

        let text = pages
            .iter()
            .filter_map(|a| a.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        let confidences: Vec<f64> = pages
            .iter()
            .flat_map(|a| a.pages.iter().flatten())
            .filter_map(|p| p.confidence)
            .collect();
        let confidence = (!confidences.is_empty())
            .then(|| confidences.iter().sum::<f64>() / confidences.len() as f64);

        Ok(OcrText { text, confidence })
    }

    async fn submit(&self, input_path: &str, output_prefix: &str) -> Result<OcrOperation> {
        let request = AnnotateRequest {
            requests: vec![FileRequest {
                input_config: InputConfig {
                    content: None,
                    gcs_source: Some(GcsSource {
                        uri: self.gs_uri(input_path),
                    }),
                    mime_type: "application/pdf",
                },
                features: vec![Feature {
                    feature_type: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context: self.image_context(),
                output_config: Some(OutputConfig {
                    gcs_destination: GcsDestination {
                        uri: self.gs_uri(output_prefix),
                    },
                    batch_size: 20,
                }),
            }],
        };

        let started: OperationStart = retry(&self.retry_policy, "vision.submit", || {
            self.post("/files:asyncBatchAnnotate", &request)
        })
        .await?;

        Ok(OcrOperation { name: started.name })
    }

    async fn poll(&self, operation: &OcrOperation) -> Result<OcrPoll> {
        let endpoint = format!("/{}", operation.name);
        let status: OperationStatus = retry(&self.retry_policy, "vision.poll", || {
            self.get(&endpoint)
        })
        .await?;

        if let Some(error) = status.error {
            return Ok(OcrPoll::Failed {
                message: error.message.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        if status.done.unwrap_or(false) {
            return Ok(OcrPoll::Done);
        }
        Ok(OcrPoll::Running)
    }
}
