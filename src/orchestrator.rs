//! The generation fallback chain.
//!
//! One request runs as follows:
//!
//! 1. Build the prompt once from the request.
//! 2. Assemble the providers, stable-sort them by priority for the request
//!    shape, and move the preferred provider to the front when it is
//!    configured.
//! 3. Try each provider in turn. An unconfigured provider is a skip, any
//!    other error is recorded and the next provider runs, and the first image
//!    wins.
//! 4. If nothing produced an image, classify the recorded failures into a
//!    remediation note.

use crate::config::{CredentialSource, EnvCredentials, OrchestratorConfig};
use crate::error::{InkVizError, Result};
use crate::image::providers::{
    HuggingFaceProvider, HuggingFaceVariant, ReplicateProvider, VertexProvider,
};
use crate::image::{
    build_prompt, GeneratedImage, GenerationRequest, ImageProvider, ImageProviderKind, PollClock,
    Poller, PromptMode, ProviderCall, ProviderStatus, TokioClock,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shown when no provider has credentials at all.
const SETUP_INSTRUCTIONS: &str = "**No image generation service configured.**

**Quick Setup (Recommended - Takes 2 minutes):**
1. Go to https://replicate.com/account/api-tokens
2. Sign up/login and create an API token
3. Copy the token (starts with r8_...)
4. Set it in the server environment:
   REPLICATE_API_TOKEN=r8_your_token_here
5. Restart the server
6. Try generating again!

Alternatively set GOOGLE_CLOUD_PROJECT_ID and GOOGLE_CLOUD_CREDENTIALS for Vertex AI, \
or HUGGINGFACE_API_KEY for Hugging Face.";

const REPLICATE_SETUP_HINT: &str = "Set up Replicate API (easiest): create a token at \
https://replicate.com/account/api-tokens and set REPLICATE_API_TOKEN.";

/// One entry of the attempt log, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Attempt {
    /// Provider lacked credentials; never reached the network.
    Skipped { provider: String },
    /// Provider was called and failed.
    Failed { provider: String, reason: String },
    /// Provider returned the image.
    Succeeded { provider: String },
}

impl Attempt {
    /// Name of the provider this entry is about.
    pub fn provider(&self) -> &str {
        match self {
            Self::Skipped { provider }
            | Self::Failed { provider, .. }
            | Self::Succeeded { provider } => provider,
        }
    }

    /// Renders a failure as `"<provider>: <reason>"`; `None` for other outcomes.
    pub fn error_line(&self) -> Option<String> {
        match self {
            Self::Failed { provider, reason } => Some(format!("{provider}: {reason}")),
            _ => None,
        }
    }
}

/// A provider produced an image.
#[derive(Debug, Clone)]
pub struct GenerationSuccess {
    /// The image.
    pub image: GeneratedImage,
    /// Prompt built for the request.
    pub prompt: String,
    /// Display name of the provider that produced the image.
    pub provider_name: String,
    /// Attempt log, ending with the success.
    pub attempts: Vec<Attempt>,
}

/// Why the chain ended without an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExhaustionKind {
    /// No provider has credentials.
    NothingConfigured,
    /// Every failure looks like a deprecated, missing or unconfigured endpoint.
    Misconfigured,
    /// Providers were configured and called but failed.
    AllFailed,
}

/// Every provider was skipped or failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Unavailable {
    /// Prompt built for the request, still useful with other tools.
    pub prompt: String,
    /// Attempt log.
    pub attempts: Vec<Attempt>,
    /// Failure lines in attempt order; skips excluded.
    pub errors: Vec<String>,
    /// Classification of the failures.
    pub diagnosis: ExhaustionKind,
    /// User-facing remediation message.
    pub note: String,
    /// Setup guide, non-empty only when nothing is configured.
    pub setup_instructions: String,
    /// True when no provider has credentials.
    pub needs_setup: bool,
    /// True when every failure points at a retired or missing endpoint.
    pub deprecated_endpoints: bool,
}

/// Result of one pass through the chain.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    /// An image was produced.
    Generated(GenerationSuccess),
    /// Nothing produced an image; the prompt and diagnostics are returned instead.
    Unavailable(Unavailable),
}

impl GenerationOutcome {
    /// Prompt built for the request.
    pub fn prompt(&self) -> &str {
        match self {
            Self::Generated(success) => &success.prompt,
            Self::Unavailable(unavailable) => &unavailable.prompt,
        }
    }

    /// Attempt log.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::Generated(success) => &success.attempts,
            Self::Unavailable(unavailable) => &unavailable.attempts,
        }
    }
}

/// Which provider families have credentials.
#[derive(Debug, Clone, Copy, Default)]
struct Presence {
    replicate: bool,
    vertex: bool,
    huggingface: bool,
}

impl Presence {
    fn of(providers: &[Box<dyn ImageProvider>]) -> Self {
        let has = |kind: ImageProviderKind| providers.iter().any(|p| p.kind() == kind && p.is_configured());
        Self {
            replicate: has(ImageProviderKind::Replicate),
            vertex: has(ImageProviderKind::Vertex),
            huggingface: has(ImageProviderKind::HuggingFace),
        }
    }

    fn any(&self) -> bool {
        self.replicate || self.vertex || self.huggingface
    }
}

impl Unavailable {
    fn classify(prompt: String, attempts: Vec<Attempt>, presence: Presence) -> Self {
        let errors: Vec<String> = attempts.iter().filter_map(Attempt::error_line).collect();
        let all = |needles: &[&str]| errors.iter().all(|e| needles.iter().any(|n| e.contains(n)));

        let all_deprecated = all(&["no longer supported", "410"]);
        let all_not_found = all(&["Not Found", "404"]);
        let all_not_configured = all(&["not configured", "not found", "requires", "Set "]);

        let (diagnosis, note, setup_instructions) = if !presence.any() {
            (
                ExhaustionKind::NothingConfigured,
                SETUP_INSTRUCTIONS.to_string(),
                SETUP_INSTRUCTIONS.to_string(),
            )
        } else if all_deprecated || all_not_found || all_not_configured {
            let advice = if !presence.replicate && !presence.vertex {
                REPLICATE_SETUP_HINT.to_string()
            } else {
                format!(
                    "Check your API keys and configuration. Errors: {}",
                    errors.join("; ")
                )
            };
            (
                ExhaustionKind::Misconfigured,
                format!("Image generation services are not properly configured. {advice}"),
                String::new(),
            )
        } else {
            let last = errors.last().map(String::as_str).unwrap_or("Unknown error");
            (
                ExhaustionKind::AllFailed,
                format!(
                    "Image generation failed: {last}. Please check your API configuration and \
                     try again. The prompt above can be used with other image generation tools."
                ),
                String::new(),
            )
        };

        Self {
            prompt,
            deprecated_endpoints: !errors.is_empty() && (all_deprecated || all_not_found),
            needs_setup: !presence.any(),
            attempts,
            errors,
            diagnosis,
            note,
            setup_instructions,
        }
    }
}

/// Orders providers for a request.
///
/// Stable sort by [`ImageProvider::priority`] for the request shape, then the
/// first configured provider whose name contains `preferred` moves to index 0.
pub fn order_providers(
    mut providers: Vec<Box<dyn ImageProvider>>,
    mode: PromptMode,
    preferred: Option<&str>,
) -> Vec<Box<dyn ImageProvider>> {
    providers.sort_by_key(|p| p.priority(mode));

    if let Some(preferred) = preferred {
        let index = providers
            .iter()
            .position(|p| p.is_configured() && p.name().contains(preferred));
        if let Some(index) = index.filter(|&i| i > 0) {
            let provider = providers.remove(index);
            tracing::debug!(provider = provider.name(), "moved preferred provider to front");
            providers.insert(0, provider);
        }
    }
    providers
}

/// Builder for GenerationOrchestrator.
pub struct GenerationOrchestratorBuilder {
    credentials: Arc<dyn CredentialSource>,
    config: OrchestratorConfig,
    clock: Arc<dyn PollClock>,
    client: Option<reqwest::Client>,
}

impl Default for GenerationOrchestratorBuilder {
    fn default() -> Self {
        Self {
            credentials: Arc::new(EnvCredentials),
            config: OrchestratorConfig::default(),
            clock: Arc::new(TokioClock),
            client: None,
        }
    }
}

impl GenerationOrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets where provider secrets come from (defaults to the environment).
    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for poll sleeps.
    pub fn clock(mut self, clock: Arc<dyn PollClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<GenerationOrchestrator> {
        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .user_agent(concat!("inkviz/", env!("CARGO_PKG_VERSION")))
                .build()?,
        };

        Ok(GenerationOrchestrator {
            credentials: self.credentials,
            config: self.config,
            clock: self.clock,
            client,
        })
    }
}

/// Runs generation requests through the provider fallback chain.
///
/// Holds no per-request state; share it behind an `Arc`.
pub struct GenerationOrchestrator {
    credentials: Arc<dyn CredentialSource>,
    config: OrchestratorConfig,
    clock: Arc<dyn PollClock>,
    client: reqwest::Client,
}

impl GenerationOrchestrator {
    pub fn builder() -> GenerationOrchestratorBuilder {
        GenerationOrchestratorBuilder::new()
    }

    /// Settings in force.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Builds the provider set from the current credentials, in base order.
    pub fn providers(&self) -> Vec<Box<dyn ImageProvider>> {
        let creds = self.credentials.as_ref();
        let endpoints = &self.config.endpoints;
        let poller = Poller::new(self.config.poll, self.clock.clone());

        let mut vertex = VertexProvider::builder()
            .credentials(creds)
            .client(self.client.clone());
        if let Some(url) = &endpoints.vertex {
            vertex = vertex.base_url(url.clone());
        }
        if let Some(uri) = &endpoints.google_token_uri {
            vertex = vertex.token_uri(uri.clone());
        }

        let huggingface = |variant: HuggingFaceVariant| {
            HuggingFaceProvider::builder()
                .variant(variant)
                .credentials(creds)
                .client(self.client.clone())
                .base_url(endpoints.huggingface.clone())
                .build()
        };

        let replicate = ReplicateProvider::builder()
            .credentials(creds)
            .client(self.client.clone())
            .base_url(endpoints.replicate.clone())
            .poller(poller)
            .build();

        vec![
            Box::new(replicate) as Box<dyn ImageProvider>,
            Box::new(vertex.build()),
            Box::new(huggingface(HuggingFaceVariant::Primary)),
            Box::new(huggingface(HuggingFaceVariant::Fallback)),
        ]
    }

    /// Configuration snapshot of every provider.
    pub fn provider_statuses(&self) -> Vec<ProviderStatus> {
        self.providers()
            .iter()
            .map(|p| ProviderStatus::of(p.as_ref()))
            .collect()
    }

    /// Providers in the order they would run for `request`.
    pub fn ordered_providers(&self, request: &GenerationRequest) -> Vec<Box<dyn ImageProvider>> {
        order_providers(
            self.providers(),
            PromptMode::for_request(request),
            self.config.preferred_provider.as_deref(),
        )
    }

    /// Runs `request` through the default providers.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        self.generate_with(request, self.providers(), cancel).await
    }

    /// Runs `request` through `providers`.
    ///
    /// Only cancellation is an error; provider failures end up in the
    /// outcome.
    pub async fn generate_with(
        &self,
        request: &GenerationRequest,
        providers: Vec<Box<dyn ImageProvider>>,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let mode = PromptMode::for_request(request);
        let prompt = build_prompt(request);
        let providers = order_providers(providers, mode, self.config.preferred_provider.as_deref());
        let presence = Presence::of(&providers);
        let deadline = self
            .config
            .request_timeout
            .map(|timeout| (tokio::time::Instant::now() + timeout, timeout));

        tracing::info!(
            mode = ?mode,
            prompt_len = prompt.len(),
            providers = ?providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "starting generation"
        );

        let mut attempts = Vec::with_capacity(providers.len());

        for provider in &providers {
            let name = provider.name().to_string();
            let call = ProviderCall::new(request, &prompt, cancel);

            let (result, deadline_hit) = match deadline {
                Some((at, timeout)) => {
                    match tokio::time::timeout_at(at, provider.generate(&call)).await {
                        Ok(result) => (result, false),
                        Err(_) => (Err(InkVizError::Timeout(timeout)), true),
                    }
                }
                None => (provider.generate(&call).await, false),
            };

            match result {
                Ok(image) if image.is_empty() => {
                    tracing::warn!(provider = %name, "provider returned empty image data");
                    attempts.push(Attempt::Failed {
                        provider: name,
                        reason: "Received empty image data".into(),
                    });
                }
                Ok(image) => {
                    tracing::info!(
                        provider = %name,
                        bytes = image.size(),
                        attempt = attempts.len() + 1,
                        "image generated"
                    );
                    attempts.push(Attempt::Succeeded {
                        provider: name.clone(),
                    });
                    return Ok(GenerationOutcome::Generated(GenerationSuccess {
                        image,
                        prompt,
                        provider_name: name,
                        attempts,
                    }));
                }
                Err(e) if e.is_skip() => {
                    tracing::debug!(provider = %name, missing = %e, "provider skipped, not configured");
                    attempts.push(Attempt::Skipped { provider: name });
                }
                Err(InkVizError::Cancelled) => {
                    tracing::info!(provider = %name, "generation cancelled");
                    return Err(InkVizError::Cancelled);
                }
                Err(e) => {
                    let preferred = self
                        .config
                        .preferred_provider
                        .as_deref()
                        .is_some_and(|p| name.contains(p));
                    if preferred {
                        tracing::warn!(provider = %name, error = %e, "preferred provider is configured but failed");
                    } else {
                        tracing::warn!(provider = %name, error = %e, "provider failed");
                    }
                    attempts.push(Attempt::Failed {
                        provider: name,
                        reason: e.to_string(),
                    });
                    if deadline_hit {
                        tracing::warn!("request deadline reached, not trying further providers");
                        break;
                    }
                }
            }
        }

        let unavailable = Unavailable::classify(prompt, attempts, presence);
        tracing::info!(
            diagnosis = ?unavailable.diagnosis,
            failures = unavailable.errors.len(),
            "no provider produced an image"
        );
        Ok(GenerationOutcome::Unavailable(unavailable))
    }
}

/// Convenience for the common case of a fixed request timeout.
pub fn request_timeout_from_secs(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|&s| s > 0).map(Duration::from_secs)
}
