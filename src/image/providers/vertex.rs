//! Vertex AI Imagen provider.
//!
//! Authenticates with a service-account key: an RS256 JWT assertion is signed
//! locally and exchanged for an OAuth access token, which then calls the
//! synchronous `:predict` endpoint of `imagegeneration@006`.

use crate::config::{
    CredentialSource, DEFAULT_GOOGLE_CLOUD_LOCATION, GOOGLE_CLOUD_CREDENTIALS,
    GOOGLE_CLOUD_LOCATION, GOOGLE_CLOUD_PROJECT_ID,
};
use crate::error::{parse_retry_after, sanitize_error_message, InkVizError, Result};
use crate::image::prompt::PromptMode;
use crate::image::provider::{
    api_error_message, cancellable, ImageProvider, Priority, ProviderCall,
};
use crate::image::types::{
    decode_base64_lenient, GeneratedImage, GenerationMetadata, GenerationRequest,
    ImageProviderKind,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Display name.
pub const VERTEX_PROVIDER_NAME: &str = "Vertex AI Imagen (GCP)";

/// Imagen model served by the predict endpoint.
pub const IMAGEN_MODEL: &str = "imagegeneration@006";

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const NEGATIVE_PROMPT: &str = "blurry, low quality, distorted, watermark";

/// Lifetime requested for the signed assertion.
const ASSERTION_TTL_SECS: u64 = 3600;

/// Builder for VertexProvider.
#[derive(Debug, Clone)]
pub struct VertexProviderBuilder {
    project_id: Option<String>,
    location: String,
    credentials_json: Option<String>,
    access_token: Option<String>,
    client: Option<reqwest::Client>,
    base_url: Option<String>,
    token_uri: Option<String>,
    priority: Priority,
}

impl Default for VertexProviderBuilder {
    fn default() -> Self {
        Self {
            project_id: None,
            location: DEFAULT_GOOGLE_CLOUD_LOCATION.to_string(),
            credentials_json: None,
            access_token: None,
            client: None,
            base_url: None,
            token_uri: None,
            priority: Priority::fixed(10),
        }
    }
}

impl VertexProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project_id(mut self, project: impl Into<String>) -> Self {
        self.project_id = Some(project.into());
        self
    }

    /// Sets the region (defaults to `us-central1`).
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Service-account key JSON as downloaded from the Cloud console.
    pub fn credentials_json(mut self, json: impl Into<String>) -> Self {
        self.credentials_json = Some(json.into());
        self
    }

    /// Uses a ready-made bearer token instead of the service-account exchange.
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Reads project, location and key from `credentials`.
    pub fn credentials(mut self, credentials: &dyn CredentialSource) -> Self {
        if let Some(project) = credentials.lookup(GOOGLE_CLOUD_PROJECT_ID) {
            self.project_id = Some(project);
        }
        if let Some(location) = credentials.lookup(GOOGLE_CLOUD_LOCATION) {
            self.location = location;
        }
        if let Some(json) = credentials.lookup(GOOGLE_CLOUD_CREDENTIALS) {
            self.credentials_json = Some(json);
        }
        self
    }

    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides `https://{location}-aiplatform.googleapis.com`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    /// Overrides the token endpoint named in the key.
    pub fn token_uri(mut self, uri: impl Into<String>) -> Self {
        self.token_uri = Some(uri.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn build(self) -> VertexProvider {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let location = if self.location.trim().is_empty() {
            DEFAULT_GOOGLE_CLOUD_LOCATION.to_string()
        } else {
            self.location
        };
        let base_url = self
            .base_url
            .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com"));

        VertexProvider {
            client: self.client.unwrap_or_default(),
            project_id: non_blank(self.project_id),
            location,
            credentials_json: non_blank(self.credentials_json),
            access_token: non_blank(self.access_token),
            base_url,
            token_uri: self.token_uri,
            priority: self.priority,
        }
    }
}

/// Vertex AI Imagen image generation provider.
pub struct VertexProvider {
    client: reqwest::Client,
    project_id: Option<String>,
    location: String,
    credentials_json: Option<String>,
    access_token: Option<String>,
    base_url: String,
    token_uri: Option<String>,
    priority: Priority,
}

impl VertexProvider {
    pub fn builder() -> VertexProviderBuilder {
        VertexProviderBuilder::new()
    }

    fn has_credentials(&self) -> bool {
        self.credentials_json.is_some() || self.access_token.is_some()
    }

    fn endpoint(&self, project: &str) -> String {
        format!(
            "{}/v1/projects/{project}/locations/{}/publishers/google/models/{IMAGEN_MODEL}:predict",
            self.base_url, self.location,
        )
    }

    /// Returns a bearer token, exchanging the service-account key if needed.
    async fn bearer_token(&self) -> Result<String> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }
        let json = self.credentials_json.as_deref().ok_or_else(|| {
            InkVizError::NotConfigured(GOOGLE_CLOUD_CREDENTIALS.into())
        })?;
        let key = ServiceAccountKey::parse(json)?;
        let token_uri = self
            .token_uri
            .clone()
            .or_else(|| key.token_uri.clone())
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        let assertion = key.sign_assertion(&token_uri, unix_now())?;

        let response = self
            .client
            .post(&token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(InkVizError::Auth(format!(
                "Vertex AI credentials error: token exchange returned {status}: {}",
                sanitize_error_message(&api_error_message(&text))
            )));
        }

        let token: TokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(InkVizError::Auth(
                "Failed to get access token from Google Cloud credentials".into(),
            ));
        }
        tracing::debug!(client_email = %key.client_email, "obtained Vertex AI access token");
        Ok(token.access_token)
    }

    async fn predict(&self, project: &str, token: &str, body: &VertexRequest<'_>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(self.endpoint(project))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!(status = status.as_u16(), "Vertex AI responded");
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(self.parse_error(status.as_u16(), &text, &headers));
        }

        let data: VertexResponse = response.json().await?;
        let prediction = data.predictions.first().ok_or_else(|| {
            InkVizError::UnexpectedResponse("Vertex AI returned no predictions".into())
        })?;

        let encoded = extract_image_base64(prediction).ok_or_else(|| {
            let keys = match prediction {
                Value::Object(map) => map.keys().cloned().collect::<Vec<_>>().join(", "),
                _ => String::new(),
            };
            InkVizError::UnexpectedResponse(format!(
                "Vertex AI response format not recognized. Prediction keys: {keys}"
            ))
        })?;

        let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.is_empty() {
            return Err(InkVizError::UnexpectedResponse(
                "Vertex AI returned empty image data".into(),
            ));
        }
        decode_base64_lenient(&cleaned).map_err(|e| InkVizError::Decode(e.to_string()))
    }

    fn parse_error(&self, status: u16, text: &str, headers: &reqwest::header::HeaderMap) -> InkVizError {
        match status {
            401 | 403 => InkVizError::Auth(
                "Vertex AI authentication failed. Check your credentials and permissions.".into(),
            ),
            404 => InkVizError::Api {
                status,
                message: "Vertex AI model not found. Make sure Imagen API is enabled in your project."
                    .into(),
            },
            429 => {
                tracing::debug!(retry_after = ?parse_retry_after(headers), "Vertex AI quota exceeded");
                InkVizError::Api {
                    status,
                    message: "Vertex AI quota exceeded. Please check your Google Cloud quotas."
                        .into(),
                }
            }
            _ => {
                let detail: String = api_error_message(text).chars().take(200).collect();
                InkVizError::Api {
                    status,
                    message: format!("Vertex AI API error: {}", sanitize_error_message(&detail)),
                }
            }
        }
    }
}

#[async_trait]
impl ImageProvider for VertexProvider {
    async fn generate(&self, call: &ProviderCall<'_>) -> Result<GeneratedImage> {
        let project = match (&self.project_id, self.has_credentials()) {
            (Some(project), true) => project.as_str(),
            _ => {
                return Err(InkVizError::NotConfigured(format!(
                    "{GOOGLE_CLOUD_PROJECT_ID} and {GOOGLE_CLOUD_CREDENTIALS}"
                )))
            }
        };
        let start = Instant::now();

        if call.request.is_image_to_image() {
            tracing::warn!("using Vertex AI with a reference image; Replicate preserves likeness better");
        }

        let token = cancellable(call.cancel, self.bearer_token()).await?;
        let body = VertexRequest::new(call.prompt, call.request);
        tracing::debug!(
            project,
            location = %self.location,
            prompt_len = call.prompt.len(),
            guidance_scale = body.parameters.guidance_scale,
            "calling Vertex AI predict"
        );

        let data = cancellable(call.cancel, self.predict(project, &token, &body)).await?;

        Ok(GeneratedImage::sniffed(
            data,
            ImageProviderKind::Vertex,
            GenerationMetadata {
                model: Some(IMAGEN_MODEL.to_string()),
                job_id: None,
                duration_ms: Some(start.elapsed().as_millis() as u64),
            },
        ))
    }

    fn kind(&self) -> ImageProviderKind {
        ImageProviderKind::Vertex
    }

    fn name(&self) -> &str {
        VERTEX_PROVIDER_NAME
    }

    fn is_configured(&self) -> bool {
        self.project_id.is_some() && self.has_credentials()
    }

    fn priority(&self, mode: PromptMode) -> i32 {
        self.priority.for_mode(mode)
    }

    fn required_credentials(&self) -> &'static [&'static str] {
        &[GOOGLE_CLOUD_PROJECT_ID, GOOGLE_CLOUD_CREDENTIALS]
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Pulls the base64 payload out of one prediction.
///
/// Imagen versions disagree on the shape; every variant seen in the wild is
/// accepted, first match wins.
fn extract_image_base64(prediction: &Value) -> Option<&str> {
    if let Some(s) = prediction.as_str() {
        return Some(s);
    }
    if let Some(s) = prediction.get("bytesBase64Encoded").and_then(Value::as_str) {
        return Some(s);
    }
    if let Some(first) = prediction
        .get("generatedImages")
        .and_then(Value::as_array)
        .and_then(|images| images.first())
    {
        return first
            .get("bytesBase64Encoded")
            .and_then(Value::as_str)
            .or_else(|| first.get("imageBytes").and_then(Value::as_str));
    }
    prediction
        .get("imageBytes")
        .and_then(Value::as_str)
        .or_else(|| prediction.get("bytes").and_then(Value::as_str))
}

/// The parts of a service-account key we need.
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

impl ServiceAccountKey {
    fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|_| {
            InkVizError::Auth(
                "Invalid credentials JSON format. Make sure GOOGLE_CLOUD_CREDENTIALS is valid JSON."
                    .into(),
            )
        })
    }

    fn sign_assertion(&self, audience: &str, now: u64) -> Result<String> {
        use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: audience,
            iat: now,
            exp: now + ASSERTION_TTL_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| InkVizError::Auth(format!("Vertex AI credentials error: {e}")))?;

        encode(&header, &claims, &key)
            .map_err(|e| InkVizError::Auth(format!("JWT generation failed: {e}")))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Serialize)]
struct VertexRequest<'a> {
    instances: [VertexInstance<'a>; 1],
    parameters: VertexParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VertexInstance<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_image: Option<BaseImage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BaseImage {
    bytes_base64_encoded: String,
    mime_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VertexParameters {
    sample_count: u8,
    aspect_ratio: &'static str,
    negative_prompt: &'static str,
    guidance_scale: u8,
}

impl<'a> VertexRequest<'a> {
    fn new(prompt: &'a str, request: &GenerationRequest) -> Self {
        let base_image = request.reference_image().map(|image| BaseImage {
            bytes_base64_encoded: image.to_base64(),
            mime_type: image.mime_type().to_string(),
        });
        // Minimum guidance lets the base image dominate.
        let guidance_scale = if base_image.is_some() { 1 } else { 7 };

        Self {
            instances: [VertexInstance { prompt, base_image }],
            parameters: VertexParameters {
                sample_count: 1,
                aspect_ratio: "1:1",
                negative_prompt: NEGATIVE_PROMPT,
                guidance_scale,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct VertexResponse {
    #[serde(default)]
    predictions: Vec<Value>,
}
