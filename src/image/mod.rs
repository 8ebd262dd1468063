//! Image generation module.

pub mod poll;
pub mod prompt;
mod provider;
pub mod providers;
mod types;

pub use poll::{PollClock, PollPolicy, PollState, PollStatus, Poller, TokioClock};
pub use prompt::{build_prompt, PromptMode, StyleFamily};
pub use provider::{ImageProvider, Priority, ProviderCall, ProviderStatus};
pub use types::{
    ColorPreference, GeneratedImage, GenerationMetadata, GenerationRequest, ImageFormat,
    ImageProviderKind, ReferenceImage, SizePreference, TattooRequestBody,
};
