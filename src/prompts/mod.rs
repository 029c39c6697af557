//! Prompt templates for the script generator.

pub mod resolver;

pub use resolver::{PromptResolver, PromptTemplate, PromptVariables, DEFAULT_SECTION, DEFAULT_THEME};
