//! Image provider trait and utilities.

use crate::error::{parse_retry_after, sanitize_error_message, InkVizError, Result};
use crate::image::prompt::PromptMode;
use crate::image::types::{GeneratedImage, GenerationRequest, ImageProviderKind};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a provider needs for one generation attempt.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCall<'a> {
    /// The validated request.
    pub request: &'a GenerationRequest,
    /// Prompt built once for the whole fallback chain.
    pub prompt: &'a str,
    /// Aborts network calls and poll sleeps when cancelled.
    pub cancel: &'a CancellationToken,
}

impl<'a> ProviderCall<'a> {
    /// Bundles the inputs of one attempt.
    pub fn new(
        request: &'a GenerationRequest,
        prompt: &'a str,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            request,
            prompt,
            cancel,
        }
    }
}

/// Trait for image generation providers.
///
/// A provider that lacks credentials must still be constructible; its
/// [`generate`](ImageProvider::generate) returns [`InkVizError::NotConfigured`]
/// without touching the network.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generates an image for the given call.
    async fn generate(&self, call: &ProviderCall<'_>) -> Result<GeneratedImage>;

    /// Returns the kind of this provider.
    fn kind(&self) -> ImageProviderKind;

    /// Returns the name of this provider for display.
    fn name(&self) -> &str;

    /// Returns true if every required credential is present.
    fn is_configured(&self) -> bool;

    /// Base rank for requests of the given shape; lower runs first.
    fn priority(&self, mode: PromptMode) -> i32;

    /// Credential keys this provider reads.
    fn required_credentials(&self) -> &'static [&'static str];
}

/// Configuration snapshot of one provider, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Display name.
    pub name: String,
    /// Provider kind.
    pub kind: ImageProviderKind,
    /// Whether the required credentials are present.
    pub configured: bool,
    /// Rank for text-to-image requests.
    pub text_priority: i32,
    /// Rank for requests with a reference image.
    pub reference_priority: i32,
    /// Credential keys the provider reads.
    pub required_credentials: Vec<String>,
}

impl ProviderStatus {
    /// Captures the status of `provider`.
    pub fn of(provider: &dyn ImageProvider) -> Self {
        Self {
            name: provider.name().to_string(),
            kind: provider.kind(),
            configured: provider.is_configured(),
            text_priority: provider.priority(PromptMode::TextToImage),
            reference_priority: provider.priority(PromptMode::Reference),
            required_credentials: provider
                .required_credentials()
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

/// Per-shape priorities of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    /// Rank for text-to-image requests.
    pub text: i32,
    /// Rank for requests with a reference image.
    pub reference: i32,
}

impl Priority {
    /// Same rank for both request shapes.
    pub const fn fixed(rank: i32) -> Self {
        Self {
            text: rank,
            reference: rank,
        }
    }

    /// Rank for `mode`.
    pub fn for_mode(&self, mode: PromptMode) -> i32 {
        match mode {
            PromptMode::TextToImage => self.text,
            PromptMode::Reference => self.reference,
        }
    }
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(InkVizError::Cancelled),
        result = fut => result,
    }
}

/// Maps a non-success response to an error, keeping a sanitized body.
pub(crate) async fn error_from_response(response: reqwest::Response) -> InkVizError {
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let text = response.text().await.unwrap_or_default();

    match status {
        401 | 403 => InkVizError::Auth(sanitize_error_message(&text)),
        429 => {
            let message = sanitize_error_message(&api_error_message(&text));
            InkVizError::RateLimited {
                message: if message.trim().is_empty() {
                    "Too many requests".to_string()
                } else {
                    message
                },
                retry_after: retry_after.map(Duration::from_secs),
            }
        }
        _ => InkVizError::Api {
            status,
            message: sanitize_error_message(&api_error_message(&text)),
        },
    }
}

/// Pulls `error`, `detail` or `error.message` out of a JSON error body,
/// falling back to the raw text.
pub(crate) fn api_error_message(text: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return text.to_string();
    };
    let field = |v: &serde_json::Value| v.as_str().map(str::to_string);

    value
        .get("error")
        .and_then(|e| field(e).or_else(|| e.get("message").and_then(field)))
        .or_else(|| value.get("detail").and_then(field))
        .unwrap_or_else(|| text.to_string())
}
