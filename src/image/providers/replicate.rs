//! Replicate-hosted Stable Diffusion XL provider.
//!
//! Predictions are asynchronous: a submit returns a prediction id that is
//! polled through [`Poller`] until it settles, then the output URL is
//! downloaded.

use crate::config::{CredentialSource, REPLICATE_API_TOKEN};
use crate::error::{InkVizError, Result};
use crate::image::poll::{PollStatus, Poller};
use crate::image::prompt::{image_strength_prompt, PromptMode};
use crate::image::provider::{
    cancellable, error_from_response, ImageProvider, Priority, ProviderCall,
};
use crate::image::types::{GeneratedImage, GenerationMetadata, GenerationRequest, ImageProviderKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Display name, also matched by the default preferred-provider override.
pub const REPLICATE_PROVIDER_NAME: &str = "Replicate Stable Diffusion XL";

/// Pinned `stability-ai/sdxl` model version.
pub const SDXL_VERSION: &str = "39ed52f2a78e934b3ba6e2a89f5b1c712de7dfea535525255b1aa35c5565e08b";

const NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, watermark, text";

/// Image influence strength sent with a reference image.
const REFERENCE_STRENGTH: f64 = 0.95;

/// Builder for ReplicateProvider.
#[derive(Debug, Clone)]
pub struct ReplicateProviderBuilder {
    api_token: Option<String>,
    client: Option<reqwest::Client>,
    base_url: String,
    poller: Poller,
    priority: Priority,
}

impl Default for ReplicateProviderBuilder {
    fn default() -> Self {
        Self {
            api_token: None,
            client: None,
            base_url: "https://api.replicate.com/v1".to_string(),
            poller: Poller::default(),
            priority: Priority::fixed(0),
        }
    }
}

impl ReplicateProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Reads `REPLICATE_API_TOKEN` from `credentials`, if present.
    pub fn credentials(mut self, credentials: &dyn CredentialSource) -> Self {
        if let Some(token) = credentials.lookup(REPLICATE_API_TOKEN) {
            self.api_token = Some(token);
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

    pub fn poller(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> ReplicateProvider {
        ReplicateProvider {
            client: self.client.unwrap_or_default(),
            api_token: self.api_token.filter(|t| !t.trim().is_empty()),
            base_url: self.base_url,
            poller: self.poller,
            priority: self.priority,
        }
    }
}

/// Replicate image generation provider.
pub struct ReplicateProvider {
    client: reqwest::Client,
    api_token: Option<String>,
    base_url: String,
    poller: Poller,
    priority: Priority,
}

impl ReplicateProvider {
    pub fn builder() -> ReplicateProviderBuilder {
        ReplicateProviderBuilder::new()
    }

    async fn submit(&self, token: &str, body: &ReplicateRequest<'_>) -> Result<Prediction> {
        let url = format!("{}/predictions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {token}"))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        Ok(response.json().await?)
    }

    async fn check(&self, token: &str, id: &str, attempt: u32) -> Result<PollStatus<String>> {
        let url = format!("{}/predictions/{}", self.base_url, id);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {token}"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let prediction: Prediction = response.json().await?;
        tracing::debug!(attempt, status = %prediction.status, "polled prediction");
        prediction.into_status()
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            if response.status().as_u16() == 403 || response.status().as_u16() == 410 {
                return Err(InkVizError::UrlExpired);
            }
            return Err(InkVizError::Api {
                status: response.status().as_u16(),
                message: "Failed to download image".into(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ImageProvider for ReplicateProvider {
    async fn generate(&self, call: &ProviderCall<'_>) -> Result<GeneratedImage> {
        let token = self
            .api_token
            .as_deref()
            .ok_or_else(|| InkVizError::NotConfigured(REPLICATE_API_TOKEN.into()))?;
        let start = Instant::now();

        // Image-to-image keeps only the bare minimum of text so the reference dominates.
        let prompt = if call.request.is_image_to_image() {
            image_strength_prompt(call.request)
        } else {
            call.prompt.to_string()
        };
        let body = ReplicateRequest::new(&prompt, call.request);

        let prediction = cancellable(call.cancel, self.submit(token, &body)).await?;
        let id = prediction.id.as_str();
        tracing::debug!(
            prediction_id = %id,
            reference = call.request.is_image_to_image(),
            "submitted prediction"
        );

        let output_url = self
            .poller
            .run(call.cancel, move |attempt| self.check(token, id, attempt))
            .await?;
        tracing::debug!(url = %output_url, "prediction succeeded");

        let data = cancellable(call.cancel, self.download(&output_url)).await?;

        Ok(GeneratedImage::sniffed(
            data,
            ImageProviderKind::Replicate,
            GenerationMetadata {
                model: Some(format!("stability-ai/sdxl:{SDXL_VERSION}")),
                job_id: Some(prediction.id.clone()),
                duration_ms: Some(start.elapsed().as_millis() as u64),
            },
        ))
    }

    fn kind(&self) -> ImageProviderKind {
        ImageProviderKind::Replicate
    }

    fn name(&self) -> &str {
        REPLICATE_PROVIDER_NAME
    }

    fn is_configured(&self) -> bool {
        self.api_token.is_some()
    }

    fn priority(&self, mode: PromptMode) -> i32 {
        self.priority.for_mode(mode)
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &[REPLICATE_API_TOKEN]
    }
}

#[derive(Debug, Serialize)]
struct ReplicateRequest<'a> {
    version: &'static str,
    input: ReplicateInput<'a>,
}

#[derive(Debug, Serialize)]
struct ReplicateInput<'a> {
    prompt: &'a str,
    num_outputs: u8,
    aspect_ratio: &'static str,
    negative_prompt: &'static str,
    /// Reference image as a data URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    /// Same data URL under the name older SDXL builds read.
    #[serde(skip_serializing_if = "Option::is_none")]
    init_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strength_scale: Option<f64>,
}

impl<'a> ReplicateRequest<'a> {
    fn new(prompt: &'a str, request: &GenerationRequest) -> Self {
        let data_url = request.reference_image().map(|image| image.to_data_url());
        let strength = data_url.as_ref().map(|_| REFERENCE_STRENGTH);

        Self {
            version: SDXL_VERSION,
            input: ReplicateInput {
                prompt,
                num_outputs: 1,
                aspect_ratio: "1:1",
                negative_prompt: NEGATIVE_PROMPT,
                image: data_url.clone(),
                init_image: data_url,
                strength,
                image_strength: strength,
                strength_scale: strength,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<PredictionOutput>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictionOutput {
    Single(String),
    Many(Vec<String>),
}

impl Prediction {
    fn into_status(self) -> Result<PollStatus<String>> {
        match self.status.as_str() {
            "succeeded" => {
                let url = match self.output {
                    Some(PredictionOutput::Single(url)) => Some(url),
                    Some(PredictionOutput::Many(urls)) => urls.into_iter().next(),
                    None => None,
                };
                url.map(PollStatus::Succeeded).ok_or_else(|| {
                    InkVizError::UnexpectedResponse("prediction succeeded without output".into())
                })
            }
            "failed" | "canceled" => {
                let reason = match self.error {
                    Some(serde_json::Value::String(s)) => s,
                    Some(serde_json::Value::Null) | None => "Unknown error".to_string(),
                    Some(other) => other.to_string(),
                };
                Ok(PollStatus::Failed(reason))
            }
            // starting, processing, or anything newer
            _ => Ok(PollStatus::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::poll::testing::RecordingClock;
    use crate::image::poll::PollPolicy;
    use crate::image::types::ReferenceImage;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nrest-of-image";

    fn provider(server: &Server) -> ReplicateProvider {
        ReplicateProvider::builder()
            .api_token("r8_test_token")
            .base_url(server.url())
            .poller(Poller::new(
                PollPolicy::default(),
                Arc::new(RecordingClock::default()),
            ))
            .build()
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("dragon", ["Fine Line"]).unwrap()
    }

    #[test]
    fn test_request_without_reference() {
        let request = request();
        let body = serde_json::to_value(ReplicateRequest::new("a prompt", &request)).unwrap();

        assert_eq!(body["version"], SDXL_VERSION);
        assert_eq!(body["input"]["num_outputs"], 1);
        assert_eq!(body["input"]["aspect_ratio"], "1:1");
        assert_eq!(body["input"]["negative_prompt"], NEGATIVE_PROMPT);
        assert!(body["input"].get("image").is_none());
        assert!(body["input"].get("strength").is_none());
    }

    #[test]
    fn test_request_with_reference() {
        let request =
            request().with_reference_image(ReferenceImage::new(b"abc".to_vec(), Some("image/jpeg")));
        let body = serde_json::to_value(ReplicateRequest::new("p", &request)).unwrap();

        assert_eq!(body["input"]["image"], "data:image/jpeg;base64,YWJj");
        assert_eq!(body["input"]["init_image"], body["input"]["image"]);
        for key in ["strength", "image_strength", "strength_scale"] {
            assert_eq!(body["input"][key], 0.95);
        }
    }

    #[test]
    fn test_prediction_status_mapping() {
        let prediction: Prediction = serde_json::from_value(json!({
            "id": "p1", "status": "succeeded", "output": ["https://a/1.png", "https://a/2.png"]
        }))
        .unwrap();
        assert_eq!(
            prediction.into_status().unwrap(),
            PollStatus::Succeeded("https://a/1.png".to_string())
        );

        let prediction: Prediction = serde_json::from_value(json!({
            "id": "p1", "status": "succeeded", "output": "https://a/only.png"
        }))
        .unwrap();
        assert_eq!(
            prediction.into_status().unwrap(),
            PollStatus::Succeeded("https://a/only.png".to_string())
        );

        let prediction: Prediction =
            serde_json::from_value(json!({"id": "p1", "status": "failed", "error": null})).unwrap();
        assert_eq!(
            prediction.into_status().unwrap(),
            PollStatus::Failed("Unknown error".to_string())
        );

        let prediction: Prediction =
            serde_json::from_value(json!({"id": "p1", "status": "starting"})).unwrap();
        assert_eq!(prediction.into_status().unwrap(), PollStatus::Pending);

        let prediction: Prediction =
            serde_json::from_value(json!({"id": "p1", "status": "succeeded"})).unwrap();
        assert!(prediction.into_status().is_err());
    }

    #[test]
    fn test_unconfigured_provider() {
        let provider = ReplicateProvider::builder().api_token("  ").build();
        assert!(!provider.is_configured());
        assert_eq!(provider.name(), REPLICATE_PROVIDER_NAME);
        assert_eq!(provider.required_credentials(), &[REPLICATE_API_TOKEN]);
    }

    #[tokio::test]
    async fn test_unconfigured_generate_skips() {
        let provider = ReplicateProvider::builder().build();
        let request = request();
        let cancel = CancellationToken::new();
        let err = provider
            .generate(&ProviderCall::new(&request, "prompt", &cancel))
            .await
            .unwrap_err();
        assert!(err.is_skip());
    }

    #[tokio::test]
    async fn test_generate_success() {
        let mut server = Server::new_async().await;
        let output_url = format!("{}/files/out.png", server.url());

        let submit = server
            .mock("POST", "/predictions")
            .match_header("authorization", "Token r8_test_token")
            .match_body(Matcher::PartialJson(json!({
                "version": SDXL_VERSION,
                "input": {"prompt": "dragon prompt"}
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(json!({"id": "pred-1", "status": "starting"}).to_string())
            .create_async()
            .await;
        let poll = server
            .mock("GET", "/predictions/pred-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"id": "pred-1", "status": "succeeded", "output": [output_url]}).to_string(),
            )
            .create_async()
            .await;
        let download = server
            .mock("GET", "/files/out.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(PNG)
            .create_async()
            .await;

        let request = request();
        let cancel = CancellationToken::new();
        let image = provider(&server)
            .generate(&ProviderCall::new(&request, "dragon prompt", &cancel))
            .await
            .unwrap();

        assert_eq!(image.data, PNG);
        assert_eq!(image.provider, ImageProviderKind::Replicate);
        assert_eq!(image.metadata.job_id.as_deref(), Some("pred-1"));
        submit.assert_async().await;
        poll.assert_async().await;
        download.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_failed_prediction() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .with_status(201)
            .with_body(json!({"id": "pred-2", "status": "starting"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/predictions/pred-2")
            .with_status(200)
            .with_body(
                json!({"id": "pred-2", "status": "failed", "error": "NSFW content detected"})
                    .to_string(),
            )
            .create_async()
            .await;

        let request = request();
        let cancel = CancellationToken::new();
        let err = provider(&server)
            .generate(&ProviderCall::new(&request, "prompt", &cancel))
            .await
            .unwrap_err();

        assert!(matches!(err, InkVizError::PollFailed(ref r) if r == "NSFW content detected"));
    }

    #[tokio::test]
    async fn test_submit_error_is_sanitized() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .with_status(422)
            .with_body(json!({"detail": "Invalid version or not permitted"}).to_string())
            .create_async()
            .await;

        let request = request();
        let cancel = CancellationToken::new();
        let err = provider(&server)
            .generate(&ProviderCall::new(&request, "prompt", &cancel))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "API error: 422 - Invalid version or not permitted");
    }

    #[tokio::test]
    async fn test_throttled_submit_keeps_detail() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .with_status(429)
            .with_header("retry-after", "8")
            .with_body(
                json!({"detail": "Request was throttled. Your rate limit resets in ~8s."})
                    .to_string(),
            )
            .create_async()
            .await;

        let request = request();
        let cancel = CancellationToken::new();
        let err = provider(&server)
            .generate(&ProviderCall::new(&request, "prompt", &cancel))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "rate limited: Request was throttled. Your rate limit resets in ~8s. (retry after 8s)"
        );
    }

    #[tokio::test]
    async fn test_expired_download() {
        let mut server = Server::new_async().await;
        let output_url = format!("{}/files/gone.png", server.url());
        server
            .mock("POST", "/predictions")
            .with_status(201)
            .with_body(json!({"id": "pred-3", "status": "starting"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/predictions/pred-3")
            .with_status(200)
            .with_body(
                json!({"id": "pred-3", "status": "succeeded", "output": output_url}).to_string(),
            )
            .create_async()
            .await;
        server
            .mock("GET", "/files/gone.png")
            .with_status(410)
            .create_async()
            .await;

        let request = request();
        let cancel = CancellationToken::new();
        let err = provider(&server)
            .generate(&ProviderCall::new(&request, "prompt", &cancel))
            .await
            .unwrap_err();

        assert!(matches!(err, InkVizError::UrlExpired));
    }
}
