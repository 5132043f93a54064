use super::vocabulary::{ACKNOWLEDGEMENTS, INTENT_TRIGGERS};

/// The discrete creative category a request resolves to. Enumeration order
/// is the keyword-classifier tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    TextOnly,
    ImageGeneration,
    ImageTransformation,
    PosterDesign,
    VisionBoard,
    BrandArtwork,
    StorySequence,
    VideoLoop,
    ProductMockup,
    Refinement,
}

impl Intent {
    pub const ALL: [Intent; 10] = [
        Intent::TextOnly,
        Intent::ImageGeneration,
        Intent::ImageTransformation,
        Intent::PosterDesign,
        Intent::VisionBoard,
        Intent::BrandArtwork,
        Intent::StorySequence,
        Intent::VideoLoop,
        Intent::ProductMockup,
        Intent::Refinement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::TextOnly => "text_only",
            Intent::ImageGeneration => "image_generation",
            Intent::ImageTransformation => "image_transformation",
            Intent::PosterDesign => "poster_design",
            Intent::VisionBoard => "vision_board",
            Intent::BrandArtwork => "brand_artwork",
            Intent::StorySequence => "story_sequence",
            Intent::VideoLoop => "video_loop",
            Intent::ProductMockup => "product_mockup",
            Intent::Refinement => "refinement",
        }
    }

    pub fn from_label(label: &str) -> Option<Intent> {
        let normalized = label.trim().to_ascii_lowercase();
        Intent::ALL
            .into_iter()
            .find(|intent| intent.as_str() == normalized)
    }

    pub fn is_visual(&self) -> bool {
        !matches!(self, Intent::TextOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplicitMode {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
}

impl Classification {
    pub fn new(intent: Intent, confidence: f64) -> Self {
        Self { intent, confidence }
    }
}

/// Weighted keyword fallback. Returns `(text_only, 0.5)` when nothing
/// matches; otherwise the arg-max intent with confidence `min(score/3, 1)`.
pub fn classify_keywords(text: &str) -> Classification {
    let lowered = text.to_lowercase();
    let mut best: Option<(Intent, u32)> = None;

    for set in INTENT_TRIGGERS {
        let hits = set
            .phrases
            .iter()
            .filter(|phrase| lowered.contains(*phrase))
            .count() as u32;
        let score = hits * set.weight;
        if score == 0 {
            continue;
        }
        let replace = match best {
            None => true,
            Some((_, best_score)) => score > best_score,
        };
        if replace {
            best = Some((set.intent, score));
        }
    }

    match best {
        Some((intent, score)) => {
            Classification::new(intent, (f64::from(score) / 3.0).min(1.0))
        }
        None => Classification::new(Intent::TextOnly, 0.5),
    }
}

/// True for short follow-up phrases like "yes" or "another one", compared
/// after trimming, lower-casing, and stripping punctuation.
pub fn is_acknowledgement(text: &str) -> bool {
    let stripped: String = text
        .trim()
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric() || ch.is_whitespace())
        .collect();
    let normalized = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return false;
    }
    ACKNOWLEDGEMENTS
        .iter()
        .any(|phrase| *phrase == normalized)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Artwork,
    Poster,
    Photo,
    VisionBoard,
    BrandAsset,
    Video,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Artwork => "artwork",
            ContentKind::Poster => "poster",
            ContentKind::Photo => "photo",
            ContentKind::VisionBoard => "vision_board",
            ContentKind::BrandAsset => "brand_asset",
            ContentKind::Video => "video",
        }
    }

    pub fn title_word(&self) -> &'static str {
        match self {
            ContentKind::Artwork => "Artwork",
            ContentKind::Poster => "Poster",
            ContentKind::Photo => "Photo",
            ContentKind::VisionBoard => "Vision Board",
            ContentKind::BrandAsset => "Brand Asset",
            ContentKind::Video => "Video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatio {
    Square,
    Portrait,
    Wide,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Wide => "16:9",
        }
    }

    pub fn dims(&self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1024, 1024),
            AspectRatio::Portrait => (768, 1024),
            AspectRatio::Wide => (1280, 720),
        }
    }
}

/// Generation knobs derived from the resolved intent, plus light text
/// inspection for the product-mockup sub-case.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub artifact_count: u32,
    pub aspect_ratio: AspectRatio,
    pub prompt_suffix: String,
    pub content_kind: ContentKind,
}

impl GenerationParams {
    pub fn for_intent(intent: Intent, text: &str) -> Self {
        let artifact_count = match intent {
            Intent::VisionBoard | Intent::StorySequence => 2,
            _ => 1,
        };
        let aspect_ratio = match intent {
            Intent::PosterDesign => AspectRatio::Portrait,
            Intent::BrandArtwork | Intent::VideoLoop => AspectRatio::Wide,
            _ => AspectRatio::Square,
        };
        let content_kind = match intent {
            Intent::ImageTransformation | Intent::Refinement => ContentKind::Photo,
            Intent::PosterDesign => ContentKind::Poster,
            Intent::VisionBoard => ContentKind::VisionBoard,
            Intent::BrandArtwork | Intent::ProductMockup => ContentKind::BrandAsset,
            Intent::VideoLoop => ContentKind::Video,
            _ => ContentKind::Artwork,
        };
        let prompt_suffix = match intent {
            Intent::ProductMockup => format!(
                "high quality, detailed, {} merchandise",
                ProductKind::from_text(text).as_str()
            ),
            _ => format!("high quality, detailed, {}", content_kind.as_str()),
        };
        Self {
            artifact_count,
            aspect_ratio,
            prompt_suffix,
            content_kind,
        }
    }
}

/// Product category for mockup compositing, inferred from request text by
/// substring matching. Defaults to a shirt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    Shirt,
    Mug,
    PhoneCase,
    Hoodie,
}

/// Placement rectangle expressed as fractions of the base-product image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ProductKind {
    pub fn from_text(text: &str) -> ProductKind {
        let lowered = text.to_lowercase();
        if lowered.contains("mug") || lowered.contains("cup") {
            ProductKind::Mug
        } else if lowered.contains("phone case") || lowered.contains("phone") {
            ProductKind::PhoneCase
        } else if lowered.contains("hoodie") || lowered.contains("sweatshirt") {
            ProductKind::Hoodie
        } else {
            ProductKind::Shirt
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProductKind::Shirt => "shirt",
            ProductKind::Mug => "mug",
            ProductKind::PhoneCase => "phone case",
            ProductKind::Hoodie => "hoodie",
        }
    }

    /// Prompt for generating the blank base-product photo the design is
    /// composited onto.
    pub fn base_prompt(&self) -> &'static str {
        match self {
            ProductKind::Shirt => {
                "plain white t-shirt on a neutral studio background, front view, product photography"
            }
            ProductKind::Mug => {
                "plain white ceramic mug on a neutral studio background, handle to the right, product photography"
            }
            ProductKind::PhoneCase => {
                "plain white phone case lying flat on a neutral studio background, product photography"
            }
            ProductKind::Hoodie => {
                "plain white hoodie on a neutral studio background, front view, product photography"
            }
        }
    }

    pub fn placement(&self) -> PlacementRect {
        match self {
            ProductKind::Shirt => PlacementRect {
                x: 0.30,
                y: 0.28,
                width: 0.40,
                height: 0.38,
            },
            ProductKind::Mug => PlacementRect {
                x: 0.36,
                y: 0.30,
                width: 0.30,
                height: 0.34,
            },
            ProductKind::PhoneCase => PlacementRect {
                x: 0.33,
                y: 0.18,
                width: 0.34,
                height: 0.60,
            },
            ProductKind::Hoodie => PlacementRect {
                x: 0.32,
                y: 0.36,
                width: 0.36,
                height: 0.30,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_classifier_picks_dominant_intent() {
        let result = classify_keywords("Design a sale poster with a banner headline");
        assert_eq!(result.intent, Intent::PosterDesign);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn keyword_classifier_defaults_to_text_only() {
        let result = classify_keywords("hmm");
        assert_eq!(result.intent, Intent::TextOnly);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn keyword_confidence_stays_in_unit_interval() {
        let loaded = "paint draw create generate make imagine design sketch \
                      illustrate render visualize show me image photo picture pic";
        let result = classify_keywords(loaded);
        assert_eq!(result.intent, Intent::ImageGeneration);
        assert_eq!(result.confidence, 1.0);

        for text in ["", "x", "poster", "video loop animation motion"] {
            let c = classify_keywords(text).confidence;
            assert!((0.0..=1.0).contains(&c), "confidence {c} out of range");
        }
    }

    #[test]
    fn video_triggers_carry_double_weight() {
        // one video trigger (weight 2) beats one image trigger (weight 1)
        let result = classify_keywords("animation of a lighthouse, painterly");
        assert_eq!(result.intent, Intent::VideoLoop);
    }

    #[test]
    fn ties_resolve_in_enumeration_order() {
        // "poster" (poster_design) and "collage" (vision_board) both score 1;
        // poster_design enumerates first.
        let result = classify_keywords("poster collage");
        assert_eq!(result.intent, Intent::PosterDesign);
    }

    #[test]
    fn acknowledgements_are_punctuation_insensitive() {
        assert!(is_acknowledgement("Yes!"));
        assert!(is_acknowledgement("  another one?? "));
        assert!(is_acknowledgement("OK."));
        assert!(!is_acknowledgement("yes but make it a poster"));
        assert!(!is_acknowledgement(""));
    }

    #[test]
    fn intent_labels_round_trip() {
        for intent in Intent::ALL {
            assert_eq!(Intent::from_label(intent.as_str()), Some(intent));
        }
        assert_eq!(Intent::from_label(" Poster_Design \n"), Some(Intent::PosterDesign));
        assert_eq!(Intent::from_label("sculpture"), None);
    }

    #[test]
    fn generation_params_follow_intent() {
        let poster = GenerationParams::for_intent(Intent::PosterDesign, "sale poster");
        assert_eq!(poster.aspect_ratio, AspectRatio::Portrait);
        assert_eq!(poster.content_kind, ContentKind::Poster);
        assert_eq!(poster.artifact_count, 1);

        let board = GenerationParams::for_intent(Intent::VisionBoard, "goals for 2026");
        assert_eq!(board.artifact_count, 2);
        assert_eq!(board.aspect_ratio, AspectRatio::Square);

        let video = GenerationParams::for_intent(Intent::VideoLoop, "looping waves");
        assert_eq!(video.aspect_ratio, AspectRatio::Wide);
        assert_eq!(video.content_kind, ContentKind::Video);
    }

    #[test]
    fn product_kind_inference_and_placements() {
        assert_eq!(ProductKind::from_text("put this on a mug"), ProductKind::Mug);
        assert_eq!(
            ProductKind::from_text("hoodie mockup please"),
            ProductKind::Hoodie
        );
        assert_eq!(ProductKind::from_text("make merch"), ProductKind::Shirt);

        let shirt = ProductKind::Shirt.placement();
        let mug = ProductKind::Mug.placement();
        assert_ne!(shirt, mug);
        assert!(ProductKind::Mug.base_prompt().contains("mug"));
    }
}
