//! Prompt construction.
//!
//! Two modes, chosen by the presence of a reference image:
//!
//! - **Reference mode** keeps the prompt deliberately short. Diffusion models
//!   doing image-to-image let a long prompt override the uploaded picture, so
//!   the shorter the prompt, the closer the output stays to the reference.
//! - **Text mode** spells out subject, style, colour, size, placement and a
//!   fixed tail of quality descriptors.
//!
//! Output is a pure function of the request.

use crate::image::types::{ColorPreference, GenerationRequest, SizePreference};

/// Separator between prompt segments.
const SEGMENT_SEPARATOR: &str = ", ";

/// Lead phrase telling the model the upload is the subject.
const REFERENCE_LEAD: &str = "tattoo of the image";

/// Tail segment of reference mode.
const REFERENCE_TAIL: &str = "preserve exact likeness";

/// Quality descriptors appended to every text-mode prompt.
const QUALITY_TAIL: [&str; 6] = [
    "clean line art",
    "professional tattoo design",
    "high quality",
    "detailed",
    "tattoo stencil style",
    "suitable for tattooing",
];

/// Which of the two construction modes applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// A reference image is present.
    Reference,
    /// Pure text-to-image.
    TextToImage,
}

impl PromptMode {
    /// Selects the mode for a request.
    pub fn for_request(request: &GenerationRequest) -> Self {
        if request.is_image_to_image() {
            Self::Reference
        } else {
            Self::TextToImage
        }
    }
}

/// Known style families, matched by keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleFamily {
    FineLine,
    Traditional,
    Realism,
    Geometric,
    /// No keyword matched; the literal style text is used.
    Other,
}

impl StyleFamily {
    /// Classifies free-text style labels.
    ///
    /// Case-insensitive substring match over the joined labels, first hit wins
    /// in the order fine-line, traditional, realism, geometric.
    pub fn classify(styles: &[String]) -> Self {
        let text = joined_styles(styles).to_lowercase();
        if text.contains("fine line") || text.contains("fineline") {
            Self::FineLine
        } else if text.contains("traditional") {
            Self::Traditional
        } else if text.contains("realism") {
            Self::Realism
        } else if text.contains("geometric") {
            Self::Geometric
        } else {
            Self::Other
        }
    }

    /// Adjective used by the short prompts (`None` for [`StyleFamily::Other`]).
    fn adjective(self) -> Option<&'static str> {
        match self {
            Self::FineLine => Some("fine line"),
            Self::Traditional => Some("traditional"),
            Self::Realism => Some("realistic"),
            Self::Geometric => Some("geometric"),
            Self::Other => None,
        }
    }

    /// Full description used in text mode.
    fn description(self) -> Option<&'static str> {
        match self {
            Self::FineLine => Some("fine line tattoo style, delicate thin lines, minimal shading"),
            Self::Traditional => Some("traditional tattoo style, bold black outlines, solid colors"),
            Self::Realism => Some("realistic tattoo style, detailed shading, photorealistic"),
            Self::Geometric => Some("geometric tattoo style, clean lines, geometric patterns"),
            Self::Other => None,
        }
    }
}

fn joined_styles(styles: &[String]) -> String {
    styles.join(SEGMENT_SEPARATOR)
}

/// Returns the subject up to the first comma, then up to the first period.
///
/// `"lion, roaring"` becomes `"lion"`. Returns `None` when nothing is left.
pub fn short_subject(subject: &str) -> Option<&str> {
    let head = subject.trim().split(',').next().unwrap_or_default();
    let head = head.split('.').next().unwrap_or_default().trim();
    (!head.is_empty()).then_some(head)
}

/// Builds the prompt for a request in the mode its shape selects.
pub fn build_prompt(request: &GenerationRequest) -> String {
    match PromptMode::for_request(request) {
        PromptMode::Reference => reference_prompt(request),
        PromptMode::TextToImage => text_prompt(request),
    }
}

/// Short prompt for image-to-image generation.
pub fn reference_prompt(request: &GenerationRequest) -> String {
    let family = StyleFamily::classify(request.styles());
    let mut parts: Vec<String> = vec![REFERENCE_LEAD.to_string()];

    parts.push(match family.adjective() {
        Some(adjective) => format!("{adjective} style"),
        None => format!("{} style", joined_styles(request.styles())),
    });

    if let Some(subject) = short_subject(request.subject_matter()) {
        parts.push(format!("incorporating {subject}"));
    }

    parts.push(
        match request.color() {
            ColorPreference::Color => "color",
            ColorPreference::BlackAndWhite | ColorPreference::Unspecified => "black and white",
        }
        .to_string(),
    );
    parts.push(REFERENCE_TAIL.to_string());

    parts.join(SEGMENT_SEPARATOR)
}

/// Long descriptive prompt for text-to-image generation.
pub fn text_prompt(request: &GenerationRequest) -> String {
    let family = StyleFamily::classify(request.styles());
    let mut parts: Vec<String> = Vec::new();

    let subject = request.subject_matter().trim();
    if !subject.is_empty() {
        parts.push(subject.to_string());
    }

    parts.push(match family.description() {
        Some(description) => description.to_string(),
        None => format!("{} tattoo style", joined_styles(request.styles())),
    });

    parts.push(
        match request.color() {
            ColorPreference::Color => "colorful tattoo, vibrant colors",
            ColorPreference::BlackAndWhite => "black and white tattoo, monochrome",
            ColorPreference::Unspecified => "black and white tattoo design",
        }
        .to_string(),
    );

    let size_clause = match request.size() {
        SizePreference::Small => Some("small tattoo design, compact composition"),
        SizePreference::Medium => Some("medium tattoo design, balanced composition"),
        SizePreference::Large => Some("large tattoo design, expansive composition"),
        SizePreference::All => None,
    };
    if let Some(clause) = size_clause {
        parts.push(clause.to_string());
    }

    if let Some(body_part) = request.body_parts().first() {
        parts.push(format!("suitable for {} placement", body_part.to_lowercase()));
    }

    parts.extend(QUALITY_TAIL.iter().map(|s| s.to_string()));

    parts.join(SEGMENT_SEPARATOR)
}

/// Even shorter prompt for image-to-image on Replicate.
///
/// Pairs with a high image strength: `tattoo of this image, <style> tattoo`
/// plus an `incorporating` clause, nothing else.
pub fn image_strength_prompt(request: &GenerationRequest) -> String {
    let family = StyleFamily::classify(request.styles());
    let style = match family.adjective() {
        Some(adjective) => format!("{adjective} tattoo"),
        None => format!("{} tattoo", joined_styles(request.styles())),
    };

    let mut parts = vec![format!("tattoo of this image, {style}")];
    if let Some(subject) = short_subject(request.subject_matter()) {
        parts.push(format!("incorporating {subject}"));
    }
    parts.join(SEGMENT_SEPARATOR)
}

/// Cuts a prompt to at most `max_chars` characters.
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> &str {
    match prompt.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &prompt[..byte_index],
        None => prompt,
    }
}
