pub mod classifier;
pub mod vocabulary;

pub use classifier::{
    classify_keywords, is_acknowledgement, AspectRatio, Classification, ContentKind, ExplicitMode,
    GenerationParams, Intent, PlacementRect, ProductKind,
};
