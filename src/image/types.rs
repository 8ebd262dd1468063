//! Core types for tattoo image generation.

use crate::error::{InkVizError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format (lossless).
    #[default]
    Png,
    /// JPEG format (lossy).
    Jpeg,
    /// WebP format (modern, efficient).
    WebP,
}

impl ImageFormat {
    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    /// Returns the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// Parses a MIME type such as `image/jpeg` (parameters are ignored).
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        // WebP: RIFF....WEBP
        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }

        None
    }
}

/// Image provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageProviderKind {
    /// Replicate-hosted Stable Diffusion XL (asynchronous, polled).
    Replicate,
    /// Google Vertex AI Imagen.
    Vertex,
    /// Hugging Face serverless inference.
    HuggingFace,
}

impl std::fmt::Display for ImageProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replicate => write!(f, "replicate"),
            Self::Vertex => write!(f, "vertex"),
            Self::HuggingFace => write!(f, "huggingface"),
        }
    }
}

/// Desired tattoo size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePreference {
    Small,
    Medium,
    Large,
    /// No preference.
    #[default]
    All,
}

impl SizePreference {
    /// Parses a UI value; anything unrecognised means "no preference".
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "small" => Self::Small,
            "medium" => Self::Medium,
            "large" => Self::Large,
            _ => Self::All,
        }
    }
}

/// Desired colour treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorPreference {
    Color,
    #[serde(rename = "bw")]
    BlackAndWhite,
    #[default]
    Unspecified,
}

impl ColorPreference {
    /// Parses a UI value (`color`, `bw`, or a spelled-out black and white);
    /// anything else is unspecified.
    pub fn parse_lenient(value: &str) -> Self {
        let normalized: String = value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '&')
            .collect();
        match normalized.as_str() {
            "color" | "colour" => Self::Color,
            "bw" | "b&w" | "blackandwhite" | "blackwhite" | "monochrome" => Self::BlackAndWhite,
            _ => Self::Unspecified,
        }
    }
}

/// An uploaded image used as the base for image-to-image generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    data: Vec<u8>,
    mime_type: String,
}

impl ReferenceImage {
    /// MIME type assumed when the client does not send one.
    pub const DEFAULT_MIME_TYPE: &'static str = "image/png";

    /// Wraps raw image bytes.
    pub fn new(data: Vec<u8>, mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(Self::DEFAULT_MIME_TYPE)
            .to_string();
        Self { data, mime_type }
    }

    /// Decodes a base64 payload (data-URI prefixes and whitespace tolerated).
    pub fn from_base64(encoded: &str, mime_type: Option<&str>) -> Result<Self> {
        let data = decode_base64_lenient(encoded)
            .map_err(|e| InkVizError::InvalidRequest(format!("invalid base64 in referenceImage: {e}")))?;
        if data.is_empty() {
            return Err(InkVizError::InvalidRequest("referenceImage is empty".into()));
        }
        Ok(Self::new(data, mime_type))
    }

    /// Raw image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// MIME type declared by the client.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Standard base64 encoding of the bytes.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// `data:<mime>;base64,<payload>` form accepted by URL-based APIs.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

/// A validated request for a tattoo concept image.
///
/// Built once per incoming request and never mutated afterwards; the
/// `with_*` methods consume the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    styles: Vec<String>,
    subject_matter: String,
    size: SizePreference,
    color: ColorPreference,
    body_parts: Vec<String>,
    reference_image: Option<ReferenceImage>,
}

impl GenerationRequest {
    /// Message returned to clients when a required field is missing.
    pub const MISSING_FIELDS: &'static str =
        "Missing required fields: subjectMatter and styles are required";

    /// Creates a request, rejecting a blank subject or an empty style list.
    pub fn new<S: Into<String>>(
        subject_matter: impl Into<String>,
        styles: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let subject_matter = subject_matter.into();
        let styles: Vec<String> = styles
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();

        if subject_matter.trim().is_empty() || styles.is_empty() {
            return Err(InkVizError::InvalidRequest(Self::MISSING_FIELDS.into()));
        }

        Ok(Self {
            styles,
            subject_matter,
            size: SizePreference::default(),
            color: ColorPreference::default(),
            body_parts: Vec::new(),
            reference_image: None,
        })
    }

    /// Sets the size preference.
    pub fn with_size(mut self, size: SizePreference) -> Self {
        self.size = size;
        self
    }

    /// Sets the colour preference.
    pub fn with_color(mut self, color: ColorPreference) -> Self {
        self.color = color;
        self
    }

    /// Sets the candidate body placements.
    pub fn with_body_parts<S: Into<String>>(mut self, parts: impl IntoIterator<Item = S>) -> Self {
        self.body_parts = parts
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.trim().is_empty())
            .collect();
        self
    }

    /// Attaches a reference image, switching prompt construction to image-to-image mode.
    pub fn with_reference_image(mut self, image: ReferenceImage) -> Self {
        self.reference_image = Some(image);
        self
    }

    /// Style labels in the order the client sent them.
    pub fn styles(&self) -> &[String] {
        &self.styles
    }

    /// Free-text subject, untrimmed.
    pub fn subject_matter(&self) -> &str {
        &self.subject_matter
    }

    pub fn size(&self) -> SizePreference {
        self.size
    }

    pub fn color(&self) -> ColorPreference {
        self.color
    }

    pub fn body_parts(&self) -> &[String] {
        &self.body_parts
    }

    pub fn reference_image(&self) -> Option<&ReferenceImage> {
        self.reference_image.as_ref()
    }

    /// Returns true if a reference image was supplied.
    pub fn is_image_to_image(&self) -> bool {
        self.reference_image.is_some()
    }
}

/// JSON body of `POST /api/generate-tattoo`.
///
/// Every field is optional at this layer so that missing values turn into a
/// 400 with a readable message instead of a deserializer error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TattooRequestBody {
    #[serde(default)]
    pub styles: Option<Vec<String>>,
    #[serde(default)]
    pub size_preference: Option<String>,
    #[serde(default)]
    pub subject_matter: Option<String>,
    #[serde(default)]
    pub color_preference: Option<String>,
    #[serde(default)]
    pub body_parts: Option<Vec<String>>,
    /// Base64 image bytes, optionally as a data URI.
    #[serde(default)]
    pub reference_image: Option<String>,
    #[serde(default)]
    pub reference_image_mime_type: Option<String>,
}

impl TryFrom<TattooRequestBody> for GenerationRequest {
    type Error = InkVizError;

    fn try_from(body: TattooRequestBody) -> Result<Self> {
        let mut request = GenerationRequest::new(
            body.subject_matter.unwrap_or_default(),
            body.styles.unwrap_or_default(),
        )?
        .with_size(
            body.size_preference
                .as_deref()
                .map(SizePreference::parse_lenient)
                .unwrap_or_default(),
        )
        .with_color(
            body.color_preference
                .as_deref()
                .map(ColorPreference::parse_lenient)
                .unwrap_or_default(),
        )
        .with_body_parts(body.body_parts.unwrap_or_default());

        if let Some(encoded) = body.reference_image.filter(|s| !s.trim().is_empty()) {
            let image = ReferenceImage::from_base64(
                &encoded,
                body.reference_image_mime_type.as_deref(),
            )?;
            request = request.with_reference_image(image);
        }

        Ok(request)
    }
}

/// Metadata about the generation process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Upstream model or version identifier.
    pub model: Option<String>,
    /// Upstream job identifier, for asynchronous providers.
    pub job_id: Option<String>,
    /// Generation duration in milliseconds.
    pub duration_ms: Option<u64>,
}

/// A generated image with its data and metadata.
#[derive(Debug, Clone)]
#[must_use = "generated image should be returned or saved"]
pub struct GeneratedImage {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Image format.
    pub format: ImageFormat,
    /// Provider that generated this image.
    pub provider: ImageProviderKind,
    /// Generation metadata.
    pub metadata: GenerationMetadata,
}

impl GeneratedImage {
    /// Creates a new generated image.
    pub fn new(
        data: Vec<u8>,
        format: ImageFormat,
        provider: ImageProviderKind,
        metadata: GenerationMetadata,
    ) -> Self {
        Self {
            data,
            format,
            provider,
            metadata,
        }
    }

    /// Creates an image whose format is sniffed from the bytes, defaulting to PNG.
    pub fn sniffed(
        data: Vec<u8>,
        provider: ImageProviderKind,
        metadata: GenerationMetadata,
    ) -> Self {
        let format = ImageFormat::from_magic_bytes(&data).unwrap_or_default();
        Self::new(data, format, provider, metadata)
    }

    /// Returns the size of the image data in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the provider handed back no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Saves the image to the specified path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// Encodes the image data as base64.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

/// Decodes a base64 string that may be imperfectly formatted.
///
/// Browsers and upstream APIs hand us base64 with a data-URI prefix, embedded
/// newlines or missing padding; all of these are normalized before decoding.
pub(crate) fn decode_base64_lenient(input: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;

    let b64 = match input.find(";base64,") {
        Some(pos) => &input[pos + 8..],
        None => input,
    };

    let cleaned: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    if let Ok(data) = base64::engine::general_purpose::STANDARD.decode(&cleaned) {
        return Ok(data);
    }

    base64::engine::general_purpose::STANDARD_NO_PAD.decode(&cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 12] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    const JPEG_MAGIC: [u8; 12] = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0, 0, 0, 0, 0];

    fn body(json: serde_json::Value) -> TattooRequestBody {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ImageFormat::from_magic_bytes(&PNG_MAGIC), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_magic_bytes(&JPEG_MAGIC), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_magic_bytes(b"short"), None);
        assert_eq!(
            ImageFormat::from_mime_type("image/jpeg; charset=binary"),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(ImageFormat::from_mime_type("application/json"), None);
    }

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ImageProviderKind::Replicate.to_string(), "replicate");
        assert_eq!(ImageProviderKind::Vertex.to_string(), "vertex");
        assert_eq!(ImageProviderKind::HuggingFace.to_string(), "huggingface");
    }

    #[test]
    fn test_request_requires_subject_and_styles() {
        let err = GenerationRequest::new("   ", ["Fine Line"]).unwrap_err();
        assert!(matches!(err, InkVizError::InvalidRequest(ref m) if m == GenerationRequest::MISSING_FIELDS));

        let no_styles: [&str; 0] = [];
        assert!(GenerationRequest::new("dragon", no_styles).is_err());
        assert!(GenerationRequest::new("dragon", [""]).is_err());
        assert!(GenerationRequest::new("dragon", ["Fine Line"]).is_ok());
    }

    #[test]
    fn test_body_conversion_full() {
        let request = GenerationRequest::try_from(body(serde_json::json!({
            "styles": ["Traditional"],
            "sizePreference": "large",
            "subjectMatter": "koi fish",
            "colorPreference": "bw",
            "bodyParts": ["Back", "Chest"],
            "referenceImage": "data:image/jpeg;base64,aGVsbG8=",
            "referenceImageMimeType": "image/jpeg"
        })))
        .unwrap();

        assert_eq!(request.styles(), ["Traditional"]);
        assert_eq!(request.size(), SizePreference::Large);
        assert_eq!(request.color(), ColorPreference::BlackAndWhite);
        assert_eq!(request.body_parts(), ["Back", "Chest"]);
        let reference = request.reference_image().unwrap();
        assert_eq!(reference.data(), b"hello");
        assert_eq!(reference.mime_type(), "image/jpeg");
    }

    #[test]
    fn test_color_preference_aliases() {
        for value in ["bw", "BW", "b&w", "black-and-white", "Black and White", "monochrome"] {
            assert_eq!(ColorPreference::parse_lenient(value), ColorPreference::BlackAndWhite, "{value}");
        }
        assert_eq!(ColorPreference::parse_lenient("colour"), ColorPreference::Color);
        assert_eq!(ColorPreference::parse_lenient("sepia"), ColorPreference::Unspecified);
    }

    #[test]
    fn test_body_conversion_defaults() {
        let request = GenerationRequest::try_from(body(serde_json::json!({
            "styles": ["Geometric"],
            "subjectMatter": "wolf",
            "sizePreference": "huge",
            "referenceImage": ""
        })))
        .unwrap();

        assert_eq!(request.size(), SizePreference::All);
        assert_eq!(request.color(), ColorPreference::Unspecified);
        assert!(request.body_parts().is_empty());
        assert!(!request.is_image_to_image());
    }

    #[test]
    fn test_body_missing_subject_is_invalid() {
        let err = GenerationRequest::try_from(body(serde_json::json!({
            "styles": ["Fine Line"]
        })))
        .unwrap_err();
        assert!(matches!(err, InkVizError::InvalidRequest(_)));
    }

    #[test]
    fn test_body_bad_reference_is_invalid() {
        let err = GenerationRequest::try_from(body(serde_json::json!({
            "styles": ["Fine Line"],
            "subjectMatter": "rose",
            "referenceImage": "!!!not base64!!!"
        })))
        .unwrap_err();
        assert!(matches!(err, InkVizError::InvalidRequest(ref m) if m.contains("referenceImage")));
    }

    #[test]
    fn test_reference_image_encodings() {
        let image = ReferenceImage::new(b"hello".to_vec(), None);
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.to_base64(), "aGVsbG8=");
        assert_eq!(image.to_data_url(), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn test_decode_base64_lenient() {
        assert_eq!(decode_base64_lenient("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_base64_lenient("aGVs\nbG8").unwrap(), b"hello");
        assert_eq!(
            decode_base64_lenient("data:image/png;base64,aGVsbG8=").unwrap(),
            b"hello"
        );
        assert!(decode_base64_lenient("%%%").is_err());
    }

    #[test]
    fn test_generated_image_sniffing() {
        let image = GeneratedImage::sniffed(
            JPEG_MAGIC.to_vec(),
            ImageProviderKind::Replicate,
            GenerationMetadata::default(),
        );
        assert_eq!(image.format, ImageFormat::Jpeg);

        let unknown = GeneratedImage::sniffed(
            vec![1, 2, 3],
            ImageProviderKind::Vertex,
            GenerationMetadata::default(),
        );
        assert_eq!(unknown.format, ImageFormat::Png);
        assert_eq!(unknown.size(), 3);
        assert!(!unknown.is_empty());
    }
}
