//! Agent handler variants and the registry the orchestrator routes through.

pub mod prompt;
pub mod registry;

pub use prompt::{HandlerProfile, PromptHandler};
pub use registry::HandlerRegistry;
