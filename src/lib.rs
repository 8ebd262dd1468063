//! InkViz - tattoo concept previews from a chain of AI image providers.
//!
//! A request (styles, subject, size, colour, placements and an optional
//! reference image) becomes one prompt. Providers are then tried in priority
//! order until one returns an image. When every provider is skipped or fails,
//! the caller still gets the prompt together with a note explaining what to
//! configure.
//!
//! # Quick Start
//!
//! ```no_run
//! use inkviz::{CancellationToken, GenerationOrchestrator, GenerationOutcome, GenerationRequest};
//!
//! #[tokio::main]
//! async fn main() -> inkviz::Result<()> {
//!     let orchestrator = GenerationOrchestrator::builder().build()?;
//!     let request = GenerationRequest::new("koi fish", ["Japanese"])?;
//!
//!     match orchestrator.generate(&request, &CancellationToken::new()).await? {
//!         GenerationOutcome::Generated(done) => done.image.save("koi.png")?,
//!         GenerationOutcome::Unavailable(unavailable) => {
//!             println!("{}\n\n{}", unavailable.prompt, unavailable.note)
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Providers
//!
//! - Replicate Stable Diffusion XL (`REPLICATE_API_TOKEN`)
//! - Vertex AI Imagen (`GOOGLE_CLOUD_PROJECT_ID`, `GOOGLE_CLOUD_CREDENTIALS`)
//! - Hugging Face, primary and fallback model lists (`HUGGINGFACE_API_KEY`)
//!
//! # Features
//!
//! - `server`: axum HTTP service (`POST /api/generate-tattoo`)
//! - `cli`: the `inkviz` binary and tracing subscriber setup

pub mod config;
mod error;
pub mod image;
mod orchestrator;

#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "cli")]
pub mod logging;

pub use config::{CredentialSource, EnvCredentials, OrchestratorConfig, StaticCredentials};
pub use error::{InkVizError, Result};
pub use image::providers::{
    HuggingFaceProvider, HuggingFaceProviderBuilder, HuggingFaceVariant, ReplicateProvider,
    ReplicateProviderBuilder, VertexProvider, VertexProviderBuilder,
};
pub use image::{
    build_prompt, GeneratedImage, GenerationRequest, ImageFormat, ImageProvider,
    ImageProviderKind, PromptMode, ReferenceImage,
};
pub use orchestrator::{
    order_providers, request_timeout_from_secs, Attempt, ExhaustionKind, GenerationOrchestrator,
    GenerationOrchestratorBuilder, GenerationOutcome, GenerationSuccess, Unavailable,
};
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{InkVizError, Result};
    pub use crate::image::{GeneratedImage, GenerationRequest, ImageProvider};
    pub use crate::orchestrator::{GenerationOrchestrator, GenerationOutcome};
    pub use tokio_util::sync::CancellationToken;
}
