//! Theme catalog: which niches exist, in which languages, with what topics.

pub mod registry;
pub mod sampler;

pub use registry::{
    DurationBounds, LanguageProfile, ListField, LocaleConfig, ThemeDefinition, ThemeRegistry,
    BUILTIN_PREFIX,
};
pub use sampler::TopicSampler;
