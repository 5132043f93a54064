use super::classifier::Intent;

pub struct TriggerSet {
    pub intent: Intent,
    pub weight: u32,
    pub phrases: &'static [&'static str],
}

/// Keyword fallback table. Scores are the weighted count of phrases found as
/// substrings of the lower-cased request text. Entries are listed in intent
/// enumeration order; ties resolve to the earliest entry.
///
/// `video_loop` and `text_only` carry double weight: their trigger vocabulary
/// overlaps less with the other categories.
pub const INTENT_TRIGGERS: &[TriggerSet] = &[
    TriggerSet {
        intent: Intent::TextOnly,
        weight: 2,
        phrases: &[
            "write a poem",
            "write me a poem",
            "poem",
            "haiku",
            "lyrics",
            "explain",
            "what is",
            "what are",
            "how do",
            "why",
            "tell me about",
            "question",
        ],
    },
    TriggerSet {
        intent: Intent::ImageGeneration,
        weight: 1,
        phrases: &[
            "paint",
            "draw",
            "create",
            "generate",
            "make",
            "imagine",
            "design",
            "sketch",
            "illustrate",
            "render",
            "visualize",
            "show me",
            "image",
            "photo",
            "picture",
            "pic",
        ],
    },
    TriggerSet {
        intent: Intent::ImageTransformation,
        weight: 1,
        phrases: &[
            "transform",
            "turn this",
            "convert",
            "reimagine",
            "restyle",
            "renaissance",
            "style transfer",
            "remake",
            "enhance",
            "edit",
        ],
    },
    TriggerSet {
        intent: Intent::PosterDesign,
        weight: 1,
        phrases: &[
            "poster",
            "signage",
            "sign",
            "banner",
            "flyer",
            "quote poster",
            "sale poster",
            "menu",
            "advertisement",
        ],
    },
    TriggerSet {
        intent: Intent::VisionBoard,
        weight: 1,
        phrases: &[
            "vision board",
            "moodboard",
            "mood board",
            "goals",
            "collage",
            "inspiration board",
        ],
    },
    TriggerSet {
        intent: Intent::BrandArtwork,
        weight: 1,
        phrases: &[
            "brand",
            "logo",
            "branding",
            "brand-themed",
            "product video",
            "premium",
            "campaign",
            "marketing",
        ],
    },
    TriggerSet {
        intent: Intent::StorySequence,
        weight: 1,
        phrases: &[
            "story",
            "storybook",
            "scene by scene",
            "sequence",
            "narrative",
            "chapter",
            "tale",
        ],
    },
    TriggerSet {
        intent: Intent::VideoLoop,
        weight: 2,
        phrases: &[
            "video loop",
            "video",
            "animation",
            "animated",
            "motion",
            "looping",
            "cinemagraph",
            "cinematic",
        ],
    },
    TriggerSet {
        intent: Intent::ProductMockup,
        weight: 1,
        phrases: &[
            "mockup",
            "mock-up",
            "merch",
            "t-shirt",
            "tshirt",
            "shirt",
            "mug",
            "phone case",
            "hoodie",
            "put this on",
            "print this on",
        ],
    },
];

/// Recognizable style terms folded into a session's preferred styles.
pub const STYLE_VOCABULARY: &[&str] = &[
    "ethereal",
    "vibrant",
    "moody",
    "minimalist",
    "surrealist",
    "impressionist",
    "photorealistic",
    "watercolor",
    "oil painting",
    "digital art",
    "abstract",
    "cinematic",
    "dreamy",
    "bold",
    "vintage",
    "futuristic",
    "noir",
    "pastel",
    "geometric",
];

/// Short follow-up phrases that reuse the previous assistant intent.
/// Matched after trimming, lower-casing, and stripping punctuation.
pub const ACKNOWLEDGEMENTS: &[&str] = &[
    "yes",
    "ok",
    "okay",
    "sure",
    "more",
    "another",
    "another one",
    "continue",
    "again",
    "yep",
    "yeah",
    "please do",
    "go ahead",
    "do it",
];
