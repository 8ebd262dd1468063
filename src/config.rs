//! Credential lookup and orchestrator settings.
//!
//! Provider configuration is never cached: every request asks the
//! [`CredentialSource`] again, so rotating a token in the environment takes
//! effect on the next call.

use crate::image::PollPolicy;
use std::collections::HashMap;
use std::time::Duration;

/// Replicate API token (`r8_...`).
pub const REPLICATE_API_TOKEN: &str = "REPLICATE_API_TOKEN";
/// Google Cloud project hosting Vertex AI.
pub const GOOGLE_CLOUD_PROJECT_ID: &str = "GOOGLE_CLOUD_PROJECT_ID";
/// Vertex AI region, defaults to [`DEFAULT_GOOGLE_CLOUD_LOCATION`].
pub const GOOGLE_CLOUD_LOCATION: &str = "GOOGLE_CLOUD_LOCATION";
/// Service-account key JSON for Vertex AI.
pub const GOOGLE_CLOUD_CREDENTIALS: &str = "GOOGLE_CLOUD_CREDENTIALS";
/// Hugging Face inference API key.
pub const HUGGINGFACE_API_KEY: &str = "HUGGINGFACE_API_KEY";

/// Region used when `GOOGLE_CLOUD_LOCATION` is unset.
pub const DEFAULT_GOOGLE_CLOUD_LOCATION: &str = "us-central1";

/// Name fragment of the provider promoted to the front when configured.
pub const DEFAULT_PREFERRED_PROVIDER: &str = "Replicate";

/// Source of provider secrets.
///
/// Only presence is checked when deciding whether a provider is configured;
/// validity is discovered by calling the provider.
pub trait CredentialSource: Send + Sync {
    /// Returns the raw value for `key`, if any.
    fn get(&self, key: &str) -> Option<String>;

    /// Returns the value for `key` if it is present and not blank.
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }
}

/// Reads credentials from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed in-memory credentials, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    /// Creates an empty credential set (every provider unconfigured).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Base URLs for every upstream API. Overridden in tests to point at a mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Replicate REST root.
    pub replicate: String,
    /// Vertex AI root; `None` derives `https://{location}-aiplatform.googleapis.com`.
    pub vertex: Option<String>,
    /// OAuth token endpoint; `None` uses the one named in the service-account key.
    pub google_token_uri: Option<String>,
    /// Hugging Face inference root (models are appended as path segments).
    pub huggingface: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            replicate: "https://api.replicate.com/v1".to_string(),
            vertex: None,
            google_token_uri: None,
            huggingface: "https://api-inference.huggingface.co/models".to_string(),
        }
    }
}

/// Settings shared by every request handled by a
/// [`GenerationOrchestrator`](crate::GenerationOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Polling cadence for asynchronous providers.
    pub poll: PollPolicy,
    /// Name fragment of the provider moved to index 0 whenever it is configured.
    pub preferred_provider: Option<String>,
    /// Deadline for the whole fallback chain. `None` waits for every provider.
    pub request_timeout: Option<Duration>,
    /// Upstream API roots.
    pub endpoints: Endpoints,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            preferred_provider: Some(DEFAULT_PREFERRED_PROVIDER.to_string()),
            request_timeout: None,
            endpoints: Endpoints::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Sets the preferred provider name fragment; `None` disables the override.
    pub fn with_preferred_provider(mut self, name: Option<String>) -> Self {
        self.preferred_provider = name.filter(|n| !n.trim().is_empty());
        self
    }

    /// Sets the deadline for the whole fallback chain.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the polling cadence.
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the upstream API roots.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials_lookup() {
        let creds = StaticCredentials::new()
            .with(REPLICATE_API_TOKEN, "r8_token")
            .with(HUGGINGFACE_API_KEY, "   ");

        assert_eq!(creds.lookup(REPLICATE_API_TOKEN).as_deref(), Some("r8_token"));
        // Blank values count as absent.
        assert_eq!(creds.get(HUGGINGFACE_API_KEY).as_deref(), Some("   "));
        assert!(creds.lookup(HUGGINGFACE_API_KEY).is_none());
        assert!(creds.lookup(GOOGLE_CLOUD_PROJECT_ID).is_none());
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.preferred_provider.as_deref(), Some("Replicate"));
        assert_eq!(config.poll.max_attempts, 60);
        assert_eq!(config.poll.interval, Duration::from_secs(1));
        assert!(config.request_timeout.is_none());
        assert_eq!(config.endpoints.replicate, "https://api.replicate.com/v1");
    }

    #[test]
    fn test_blank_preferred_provider_disables_override() {
        let config = OrchestratorConfig::default().with_preferred_provider(Some(" ".into()));
        assert!(config.preferred_provider.is_none());
    }
}
