//! Request orchestration: a fixed graph of nodes that classifies a request,
//! routes it through one or more agent handlers and synthesizes the reply,
//! either in one piece or as a stream of events.

pub mod classifier;
pub mod graph;
pub mod handlers;
pub mod metrics;
mod nodes;
pub mod orchestrator;
pub mod rate_limit;
pub mod validation;

pub use classifier::LlmClassifier;
pub use graph::{NodeId, RequestState};
pub use handlers::{HandlerProfile, HandlerRegistry, PromptHandler};
pub use metrics::{HandlerMetrics, MetricsSnapshot, RequestMetrics};
pub use nodes::NOTES_SEPARATOR;
pub use orchestrator::{Orchestrator, RunReport, DEFAULT_CALLER};
pub use rate_limit::{Admission, RateLimiter};
pub use validation::DefaultValidator;
