//! Image generation providers.

mod huggingface;
mod replicate;
mod vertex;

pub use huggingface::{
    HuggingFaceProvider, HuggingFaceProviderBuilder, HuggingFaceVariant,
    HUGGINGFACE_FALLBACK_PROVIDER_NAME, HUGGINGFACE_PROVIDER_NAME,
};
pub use replicate::{
    ReplicateProvider, ReplicateProviderBuilder, REPLICATE_PROVIDER_NAME, SDXL_VERSION,
};
pub use vertex::{VertexProvider, VertexProviderBuilder, IMAGEN_MODEL, VERTEX_PROVIDER_NAME};
