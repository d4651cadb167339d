use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use maestro_core::config::ModelConfig;
use maestro_core::traits::{AgentHandler, LlmClient};
use maestro_core::types::{HandlerId, TaskCategory};

use super::prompt::{self, HandlerProfile, PromptHandler};

/// Handlers available to the orchestrator, keyed by id, with a designated
/// fallback for ids that were never registered.
pub struct HandlerRegistry {
    handlers: BTreeMap<HandlerId, Arc<dyn AgentHandler>>,
    default_id: HandlerId,
    default: Arc<dyn AgentHandler>,
}

impl HandlerRegistry {
    /// Create a registry whose fallback is `default`.
    pub fn new(default: Arc<dyn AgentHandler>) -> Self {
        let default_id = default.id();
        let mut handlers = BTreeMap::new();
        handlers.insert(default_id.clone(), default.clone());
        Self {
            handlers,
            default_id,
            default,
        }
    }

    /// Every built-in variant backed by one LLM, with `chat` as fallback.
    pub fn with_llm(llm: Arc<dyn LlmClient>, model: &ModelConfig) -> Self {
        let handler = |profile: HandlerProfile| -> Arc<dyn AgentHandler> {
            Arc::new(PromptHandler::new(profile, llm.clone(), model))
        };
        Self::new(handler(prompt::CHAT))
            .with_handler(handler(prompt::ANALYSIS))
            .with_handler(handler(prompt::GRADING))
            .with_handler(handler(prompt::FORMATTING))
            .with_handler(handler(prompt::CODE_REVIEW))
    }

    /// Register a handler under its own id, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn AgentHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn AgentHandler>) {
        let id = handler.id();
        debug!(handler = %id, "Handler registered");
        if id == self.default_id {
            self.default = handler.clone();
        }
        self.handlers.insert(id, handler);
    }

    pub fn get(&self, id: &HandlerId) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn contains(&self, id: &HandlerId) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn default_id(&self) -> &HandlerId {
        &self.default_id
    }

    pub fn default_handler(&self) -> Arc<dyn AgentHandler> {
        self.default.clone()
    }

    /// The handler for `id`, or the default one.
    pub fn resolve(&self, id: &HandlerId) -> Arc<dyn AgentHandler> {
        match self.get(id) {
            Some(handler) => handler,
            None => {
                warn!(requested = %id, fallback = %self.default_id, "No handler registered, using default");
                self.default_handler()
            }
        }
    }

    pub fn for_category(&self, category: TaskCategory) -> Arc<dyn AgentHandler> {
        self.resolve(&HandlerId::from(category))
    }

    pub fn ids(&self) -> Vec<HandlerId> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
