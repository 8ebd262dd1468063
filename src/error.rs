//! Error types for tattoo image generation.

use std::time::Duration;

/// Errors that can occur while building a request or calling a provider.
#[derive(Debug, thiserror::Error)]
pub enum InkVizError {
    /// Credentials missing, malformed or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Rate limit exceeded.
    #[error("rate limited: {message}{}", retry_hint(.retry_after))]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Polling ceiling or request deadline reached.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Download URL expired before download.
    #[error("download URL expired")]
    UrlExpired,

    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Network or HTTP error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Failed to decode base64 data.
    #[error("failed to decode: {0}")]
    Decode(String),

    /// I/O error (e.g., saving file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Provider lacks the credentials it needs; the call never left the process.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The provider answered, but not in a shape we understand.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// An asynchronous job reported a terminal failure.
    #[error("prediction failed: {0}")]
    PollFailed(String),

    /// The caller cancelled the request.
    #[error("operation cancelled")]
    Cancelled,
}

impl InkVizError {
    /// Returns true for the distinguished "skip" signal of an unconfigured provider.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::NotConfigured(_))
    }
}

/// Result type alias for generation operations.
pub type Result<T> = std::result::Result<T, InkVizError>;

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}s)", delay.as_secs()),
        None => String::new(),
    }
}

/// Maximum length of an upstream error body we keep in messages.
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Trims an upstream error body and masks anything that looks like a credential.
///
/// Provider error bodies end up in user-visible diagnostics, so tokens echoed
/// back by an API (`r8_...`, `hf_...`, bearer headers) must not leak through.
pub(crate) fn sanitize_error_message(text: &str) -> String {
    let masked: Vec<String> = text
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
            let looks_like_key = ((bare.starts_with("r8_") || bare.starts_with("hf_"))
                && bare.len() > 8)
                || bare.starts_with("ya29");
            if looks_like_key {
                word.replace(bare, "[redacted]")
            } else {
                word.to_string()
            }
        })
        .collect();
    let joined = masked.join(" ");

    if joined.chars().count() > MAX_ERROR_MESSAGE_CHARS {
        let cut: String = joined.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
        format!("{cut}...")
    } else {
        joined
    }
}

/// Reads a `Retry-After` header expressed in whole seconds.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_skip() {
        assert!(InkVizError::NotConfigured("REPLICATE_API_TOKEN".into()).is_skip());
        assert!(!InkVizError::Auth("bad key".into()).is_skip());
        assert!(!InkVizError::PollFailed("nsfw".into()).is_skip());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = InkVizError::RateLimited {
            message: "Request was throttled.".into(),
            retry_after: Some(Duration::from_secs(8)),
        };
        assert_eq!(err.to_string(), "rate limited: Request was throttled. (retry after 8s)");

        let err = InkVizError::RateLimited {
            message: "Too many requests".into(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "rate limited: Too many requests");
    }

    #[test]
    fn test_error_display() {
        let err = InkVizError::Api {
            status: 404,
            message: "Not found".into(),
        };
        assert_eq!(err.to_string(), "API error: 404 - Not found");

        let err = InkVizError::PollFailed("NSFW content detected".into());
        assert_eq!(err.to_string(), "prediction failed: NSFW content detected");
    }

    #[test]
    fn test_sanitize_masks_tokens() {
        let msg = sanitize_error_message("invalid token r8_abcdefghijklmnop supplied");
        assert_eq!(msg, "invalid token [redacted] supplied");

        let msg = sanitize_error_message("Bearer hf_0123456789abcdef rejected");
        assert!(!msg.contains("hf_0123456789abcdef"));
    }

    #[test]
    fn test_sanitize_truncates_long_bodies() {
        let long = "x".repeat(2_000);
        let msg = sanitize_error_message(&long);
        assert_eq!(msg.chars().count(), MAX_ERROR_MESSAGE_CHARS + 3);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(
            reqwest::header::RETRY_AFTER,
            reqwest::header::HeaderValue::from_static("12"),
        );
        assert_eq!(parse_retry_after(&headers), Some(12));
    }
}
