//! Hugging Face serverless inference providers.
//!
//! Each variant walks a short list of Stable Diffusion checkpoints. Hugging
//! Face retires models from the serverless API without notice, so a
//! deprecated endpoint is not an error, the next one is simply tried.

use crate::config::{CredentialSource, HUGGINGFACE_API_KEY};
use crate::error::{sanitize_error_message, InkVizError, Result};
use crate::image::prompt::{truncate_prompt, PromptMode};
use crate::image::provider::{cancellable, ImageProvider, Priority, ProviderCall};
use crate::image::types::{GeneratedImage, GenerationMetadata, ImageFormat, ImageProviderKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

/// Display name of the primary variant.
pub const HUGGINGFACE_PROVIDER_NAME: &str = "Hugging Face Stable Diffusion";

/// Display name of the fallback variant.
pub const HUGGINGFACE_FALLBACK_PROVIDER_NAME: &str = "Hugging Face Stable Diffusion (Fallback)";

const PRIMARY_MODELS: [&str; 3] = [
    "runwayml/stable-diffusion-v1-5",
    "stabilityai/stable-diffusion-xl-base-1.0",
    "CompVis/stable-diffusion-v1-4",
];

const FALLBACK_MODELS: [&str; 3] = [
    "stabilityai/stable-diffusion-2-1",
    "runwayml/stable-diffusion-v1-5",
    "CompVis/stable-diffusion-v1-4",
];

const ALL_ENDPOINTS_FAILED: &str = "All Hugging Face endpoints failed";

/// Longest prompt sent by the fallback variant.
const FALLBACK_PROMPT_CHARS: usize = 300;

/// Which checkpoint list and request shape to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuggingFaceVariant {
    /// Full prompt with explicit sampler parameters.
    Primary,
    /// Truncated prompt, server-side defaults.
    Fallback,
}

impl HuggingFaceVariant {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Primary => HUGGINGFACE_PROVIDER_NAME,
            Self::Fallback => HUGGINGFACE_FALLBACK_PROVIDER_NAME,
        }
    }

    /// Checkpoints tried in order.
    pub fn models(&self) -> &'static [&'static str] {
        match self {
            Self::Primary => &PRIMARY_MODELS,
            Self::Fallback => &FALLBACK_MODELS,
        }
    }

    fn default_priority(&self) -> Priority {
        match self {
            Self::Primary => Priority::fixed(20),
            Self::Fallback => Priority::fixed(30),
        }
    }

    fn request<'a>(&self, prompt: &'a str) -> HuggingFaceRequest<'a> {
        match self {
            Self::Primary => HuggingFaceRequest {
                inputs: prompt,
                parameters: Some(HuggingFaceParameters {
                    num_inference_steps: 50,
                    guidance_scale: 7.5,
                }),
            },
            Self::Fallback => HuggingFaceRequest {
                inputs: truncate_prompt(prompt, FALLBACK_PROMPT_CHARS),
                parameters: None,
            },
        }
    }
}

/// Builder for HuggingFaceProvider.
#[derive(Debug, Clone)]
pub struct HuggingFaceProviderBuilder {
    variant: HuggingFaceVariant,
    api_key: Option<String>,
    client: Option<reqwest::Client>,
    base_url: String,
    priority: Option<Priority>,
}

impl Default for HuggingFaceProviderBuilder {
    fn default() -> Self {
        Self {
            variant: HuggingFaceVariant::Primary,
            api_key: None,
            client: None,
            base_url: "https://api-inference.huggingface.co/models".to_string(),
            priority: None,
        }
    }
}

impl HuggingFaceProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variant(mut self, variant: HuggingFaceVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Reads `HUGGINGFACE_API_KEY` from `credentials`, if present.
    pub fn credentials(mut self, credentials: &dyn CredentialSource) -> Self {
        if let Some(key) = credentials.lookup(HUGGINGFACE_API_KEY) {
            self.api_key = Some(key);
        }
        self
    }

    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn build(self) -> HuggingFaceProvider {
        HuggingFaceProvider {
            client: self.client.unwrap_or_default(),
            api_key: self.api_key.filter(|k| !k.trim().is_empty()),
            base_url: self.base_url,
            priority: self
                .priority
                .unwrap_or_else(|| self.variant.default_priority()),
            variant: self.variant,
        }
    }
}

/// Hugging Face image generation provider.
pub struct HuggingFaceProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    variant: HuggingFaceVariant,
    priority: Priority,
}

/// Result of one checkpoint call that did not fail outright.
enum EndpointOutcome {
    Image {
        data: Vec<u8>,
        format: Option<ImageFormat>,
    },
    Deprecated,
}

impl HuggingFaceProvider {
    pub fn builder() -> HuggingFaceProviderBuilder {
        HuggingFaceProviderBuilder::new()
    }

    async fn call_model(
        &self,
        model: &str,
        key: &str,
        body: &HuggingFaceRequest<'_>,
    ) -> Result<EndpointOutcome> {
        let url = format!("{}/{}", self.base_url, model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(model, status, content_type = %content_type, "Hugging Face responded");

        if content_type.starts_with("image/") {
            let data = response.bytes().await?.to_vec();
            return Ok(EndpointOutcome::Image {
                data,
                format: ImageFormat::from_mime_type(&content_type),
            });
        }

        let text = response.text().await.unwrap_or_default();
        if text.contains("no longer supported") || text.contains("router.huggingface.co") {
            return Ok(EndpointOutcome::Deprecated);
        }

        Err(parse_error(status, &text))
    }
}

#[async_trait]
impl ImageProvider for HuggingFaceProvider {
    async fn generate(&self, call: &ProviderCall<'_>) -> Result<GeneratedImage> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| InkVizError::NotConfigured(HUGGINGFACE_API_KEY.into()))?;
        let start = Instant::now();
        let body = self.variant.request(call.prompt);
        let models = self.variant.models();

        for (index, model) in models.iter().enumerate() {
            let last = index + 1 == models.len();
            tracing::debug!(model, variant = ?self.variant, "attempting Hugging Face model");

            match cancellable(call.cancel, self.call_model(model, key, &body)).await {
                Ok(EndpointOutcome::Image { data, format }) => {
                    let metadata = GenerationMetadata {
                        model: Some(model.to_string()),
                        job_id: None,
                        duration_ms: Some(start.elapsed().as_millis() as u64),
                    };
                    return Ok(match format {
                        Some(format) => {
                            GeneratedImage::new(data, format, ImageProviderKind::HuggingFace, metadata)
                        }
                        None => GeneratedImage::sniffed(data, ImageProviderKind::HuggingFace, metadata),
                    });
                }
                Ok(EndpointOutcome::Deprecated) => {
                    tracing::debug!(model, "endpoint deprecated, trying next");
                }
                Err(InkVizError::Cancelled) => return Err(InkVizError::Cancelled),
                Err(e) if !last => {
                    tracing::debug!(model, error = %e, "endpoint failed, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        // Every checkpoint was retired; no single HTTP status describes that.
        Err(InkVizError::UnexpectedResponse(ALL_ENDPOINTS_FAILED.into()))
    }

    fn kind(&self) -> ImageProviderKind {
        ImageProviderKind::HuggingFace
    }

    fn name(&self) -> &str {
        self.variant.name()
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn priority(&self, mode: PromptMode) -> i32 {
        self.priority.for_mode(mode)
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &[HUGGINGFACE_API_KEY]
    }
}

/// Builds the failure for a non-image, non-deprecated response.
fn parse_error(status: u16, text: &str) -> InkVizError {
    let body: HuggingFaceErrorBody = serde_json::from_str(text).unwrap_or_default();
    let message = body.error.as_ref().map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    let loading = message.as_deref().is_some_and(|m| m.contains("loading"));
    if loading || body.estimated_time.is_some() {
        let wait = body
            .estimated_time
            .map(|secs| format!(" (estimated wait: {}s)", secs.ceil() as u64))
            .unwrap_or_default();
        return InkVizError::Api {
            status,
            message: format!("Model is loading{wait}. Please try again in a moment."),
        };
    }

    match status {
        401 | 403 => InkVizError::Auth(
            "Invalid Hugging Face API key. Please check HUGGINGFACE_API_KEY".into(),
        ),
        429 => InkVizError::Api {
            status,
            message: "Hugging Face rate limit exceeded. Please wait a moment and try again.".into(),
        },
        _ => {
            let message = match message {
                Some(m) => format!("Hugging Face API error: {}", sanitize_error_message(&m)),
                None => {
                    let snippet: String = text.chars().take(200).collect();
                    format!(
                        "Hugging Face returned error (status {status}): {}",
                        sanitize_error_message(&snippet)
                    )
                }
            };
            InkVizError::Api { status, message }
        }
    }
}

#[derive(Debug, Serialize)]
struct HuggingFaceRequest<'a> {
    inputs: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<HuggingFaceParameters>,
}

#[derive(Debug, Serialize)]
struct HuggingFaceParameters {
    num_inference_steps: u32,
    guidance_scale: f64,
}

#[derive(Debug, Default, Deserialize)]
struct HuggingFaceErrorBody {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    estimated_time: Option<f64>,
}
