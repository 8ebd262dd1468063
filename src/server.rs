//! HTTP surface.
//!
//! `POST /api/generate-tattoo` runs the fallback chain on a spawned task. A
//! client that disconnects drops the handler future, whose drop guard cancels
//! that task; a panic inside it becomes a 500.

use crate::error::InkVizError;
use crate::image::{GenerationRequest, ProviderStatus, TattooRequestBody};
use crate::orchestrator::{GenerationOrchestrator, GenerationOutcome, Unavailable};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Reference images arrive base64-encoded inside the JSON body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 12 * 1024 * 1024;

const GENERIC_FAILURE: &str = "Failed to generate tattoo";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<GenerationOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<GenerationOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/generate-tattoo", post(generate_tattoo_handler))
        .route("/api/providers", get(providers_handler))
        .route("/healthz", get(healthz_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedBody {
    success: bool,
    image: String,
    mime_type: &'static str,
    prompt: String,
    model: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnavailableBody {
    success: bool,
    prompt: String,
    note: String,
    image_generation_available: bool,
    needs_setup: bool,
    setup_instructions: String,
    errors: Vec<String>,
    hugging_face_api_deprecated: bool,
}

impl From<Unavailable> for UnavailableBody {
    fn from(unavailable: Unavailable) -> Self {
        Self {
            success: true,
            prompt: unavailable.prompt,
            note: unavailable.note,
            image_generation_available: false,
            needs_setup: unavailable.needs_setup,
            setup_instructions: unavailable.setup_instructions,
            errors: unavailable.errors,
            hugging_face_api_deprecated: unavailable.deprecated_endpoints,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvidersBody {
    preferred_provider: Option<String>,
    providers: Vec<ProviderStatus>,
}

async fn generate_tattoo_handler(
    State(state): State<AppState>,
    body: Result<Json<TattooRequestBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(error = %rejection.body_text(), "rejected request body");
            let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            return error_response(status, rejection.body_text());
        }
    };

    let request = match GenerationRequest::try_from(body) {
        Ok(request) => request,
        Err(InkVizError::InvalidRequest(message)) => {
            return error_response(StatusCode::BAD_REQUEST, message);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to build generation request");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE);
        }
    };

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.generate(&request, &cancel).await });

    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, "generation task did not complete");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE);
        }
    };

    match outcome {
        Ok(GenerationOutcome::Generated(success)) => Json(GeneratedBody {
            success: true,
            image: success.image.to_base64(),
            mime_type: success.image.format.mime_type(),
            prompt: success.prompt,
            model: success.provider_name,
        })
        .into_response(),
        Ok(GenerationOutcome::Unavailable(unavailable)) => {
            Json(UnavailableBody::from(unavailable)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "error generating tattoo");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE)
        }
    }
}

async fn providers_handler(State(state): State<AppState>) -> Json<ProvidersBody> {
    Json(ProvidersBody {
        preferred_provider: state.orchestrator.config().preferred_provider.clone(),
        providers: state.orchestrator.provider_statuses(),
    })
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, OrchestratorConfig, StaticCredentials, REPLICATE_API_TOKEN};
    use crate::image::poll::testing::RecordingClock;
    use crate::image::poll::PollClock;
    use crate::image::GenerationRequest;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nserver-test";

    fn app(credentials: StaticCredentials, config: OrchestratorConfig) -> Router {
        app_with_clock(credentials, config, Arc::new(RecordingClock::default()))
    }

    fn app_with_clock(
        credentials: StaticCredentials,
        config: OrchestratorConfig,
        clock: Arc<dyn PollClock>,
    ) -> Router {
        let orchestrator = GenerationOrchestrator::builder()
            .credentials(Arc::new(credentials))
            .config(config)
            .clock(clock)
            .build()
            .unwrap();
        build_router(AppState::new(Arc::new(orchestrator)), DEFAULT_MAX_BODY_BYTES)
    }

    /// Replicate app whose prediction never leaves `starting`.
    async fn stalled_replicate_app(
        server: &mut mockito::Server,
        clock: Arc<dyn PollClock>,
    ) -> Router {
        server
            .mock("POST", "/predictions")
            .with_status(201)
            .with_body(json!({"id": "slow", "status": "starting"}).to_string())
            .create_async()
            .await;
        let config = OrchestratorConfig::default().with_endpoints(Endpoints {
            replicate: server.url(),
            ..Endpoints::default()
        });
        app_with_clock(
            StaticCredentials::new().with(REPLICATE_API_TOKEN, "r8_slow"),
            config,
            clock,
        )
    }

    /// Parks every poll sleep until the sleeping future is dropped.
    #[derive(Default)]
    struct StallingClock {
        entered: Notify,
        released: Arc<Notify>,
    }

    struct ReleaseOnDrop(Arc<Notify>);

    impl Drop for ReleaseOnDrop {
        fn drop(&mut self) {
            self.0.notify_one();
        }
    }

    #[async_trait]
    impl PollClock for StallingClock {
        async fn sleep(&self, _duration: Duration) {
            let _release = ReleaseOnDrop(self.released.clone());
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }
    }

    struct PanickingClock;

    #[async_trait]
    impl PollClock for PanickingClock {
        async fn sleep(&self, _duration: Duration) {
            panic!("clock failure");
        }
    }

    fn unconfigured_app() -> Router {
        app(StaticCredentials::new(), OrchestratorConfig::default())
    }

    async fn post_json(app: Router, body: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/generate-tattoo")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_missing_subject_matter_is_bad_request() {
        let (status, body) = post_json(
            unconfigured_app(),
            json!({"styles": ["Fine Line"]}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], GenerationRequest::MISSING_FIELDS);
    }

    #[tokio::test]
    async fn test_empty_styles_is_bad_request() {
        let (status, body) = post_json(
            unconfigured_app(),
            json!({"styles": [], "subjectMatter": "dragon"}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], GenerationRequest::MISSING_FIELDS);
    }

    #[tokio::test]
    async fn test_invalid_reference_image_is_bad_request() {
        let (status, body) = post_json(
            unconfigured_app(),
            json!({"styles": ["Blackwork"], "subjectMatter": "moth", "referenceImage": "@@not base64@@"})
                .to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("referenceImage"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (status, body) = post_json(unconfigured_app(), "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unconfigured_returns_prompt_and_setup() {
        let (status, body) = post_json(
            unconfigured_app(),
            json!({"styles": ["Fine Line"], "subjectMatter": "dragon"}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["imageGenerationAvailable"], false);
        assert_eq!(body["needsSetup"], true);
        assert_eq!(body["errors"], json!([]));
        assert_eq!(body["huggingFaceApiDeprecated"], false);
        assert!(body["prompt"].as_str().unwrap().starts_with("dragon"));
        assert!(body["setupInstructions"]
            .as_str()
            .unwrap()
            .contains("REPLICATE_API_TOKEN"));
    }

    #[tokio::test]
    async fn test_generated_image_response() {
        let mut server = mockito::Server::new_async().await;
        let output = format!("{}/out.png", server.url());
        server
            .mock("POST", "/predictions")
            .with_status(201)
            .with_body(json!({"id": "srv", "status": "starting"}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/predictions/srv")
            .with_status(200)
            .with_body(json!({"id": "srv", "status": "succeeded", "output": output}).to_string())
            .create_async()
            .await;
        server
            .mock("GET", "/out.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(PNG)
            .create_async()
            .await;

        let config = OrchestratorConfig::default().with_endpoints(Endpoints {
            replicate: server.url(),
            ..Endpoints::default()
        });
        let app = app(
            StaticCredentials::new().with(REPLICATE_API_TOKEN, "r8_server"),
            config,
        );

        let (status, body) = post_json(
            app,
            json!({"styles": ["Traditional"], "subjectMatter": "swallow", "colorPreference": "color"})
                .to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["model"], "Replicate Stable Diffusion XL");
        assert_eq!(body["mimeType"], "image/png");
        use base64::Engine;
        assert_eq!(
            body["image"],
            base64::engine::general_purpose::STANDARD.encode(PNG)
        );
    }

    #[tokio::test]
    async fn test_retired_model_sets_deprecated_flag() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/predictions")
            .with_status(410)
            .with_body(json!({"detail": "version retired"}).to_string())
            .create_async()
            .await;
        let config = OrchestratorConfig::default().with_endpoints(Endpoints {
            replicate: server.url(),
            ..Endpoints::default()
        });
        let app = app(
            StaticCredentials::new().with(REPLICATE_API_TOKEN, "r8_old"),
            config,
        );

        let (status, body) = post_json(
            app,
            json!({"styles": ["Dotwork"], "subjectMatter": "mandala"}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["imageGenerationAvailable"], false);
        assert_eq!(body["huggingFaceApiDeprecated"], true);
        assert!(body.get("hugginFaceApiDeprecated").is_none());
        assert_eq!(
            body["errors"],
            json!(["Replicate Stable Diffusion XL: API error: 410 - version retired"])
        );
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_generation() {
        let mut server = mockito::Server::new_async().await;
        let clock = Arc::new(StallingClock::default());
        let app = stalled_replicate_app(&mut server, clock.clone()).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/generate-tattoo")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"styles": ["Blackwork"], "subjectMatter": "raven"}).to_string(),
            ))
            .unwrap();
        let handle = tokio::spawn(app.oneshot(request));

        tokio::time::timeout(Duration::from_secs(5), clock.entered.notified())
            .await
            .expect("provider never started polling");
        handle.abort();

        tokio::time::timeout(Duration::from_secs(5), clock.released.notified())
            .await
            .expect("in-flight poll was not cancelled");
        assert!(handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_generation_panic_is_internal_error() {
        let mut server = mockito::Server::new_async().await;
        let app = stalled_replicate_app(&mut server, Arc::new(PanickingClock)).await;

        let (status, body) = post_json(
            app,
            json!({"styles": ["Blackwork"], "subjectMatter": "raven"}).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Failed to generate tattoo"}));
    }

    #[tokio::test]
    async fn test_providers_route() {
        let app = app(
            StaticCredentials::new().with(REPLICATE_API_TOKEN, "r8_x"),
            OrchestratorConfig::default(),
        );
        let request = Request::builder()
            .uri("/api/providers")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["preferredProvider"], "Replicate");
        let providers = body["providers"].as_array().unwrap();
        assert_eq!(providers.len(), 4);
        assert_eq!(providers[0]["name"], "Replicate Stable Diffusion XL");
        assert_eq!(providers[0]["configured"], true);
        assert_eq!(providers[1]["configured"], false);
    }

    #[tokio::test]
    async fn test_healthz() {
        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = unconfigured_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
