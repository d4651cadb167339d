use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use tracing::debug;

use maestro_core::config::ModelConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{AgentHandler, LlmClient};
use maestro_core::types::{ChatMessage, HandlerId, Message};
use maestro_memory::history::to_llm_messages;

/// Static description of an LLM-backed handler variant.
#[derive(Debug, Clone, Copy)]
pub struct HandlerProfile {
    pub id: &'static str,
    pub system_prompt: &'static str,
    pub include_history: bool,
    /// Prefix placed before the input, separated by a blank line.
    pub input_preamble: Option<&'static str>,
    pub temperature: Option<f32>,
}

pub const CHAT: HandlerProfile = HandlerProfile {
    id: "chat",
    system_prompt: "You are a helpful and friendly AI assistant. You excel at general \
        conversation, answering questions, providing explanations, and helping users \
        with various tasks. Be conversational, helpful, and engaging.",
    include_history: true,
    input_preamble: None,
    temperature: None,
};

pub const ANALYSIS: HandlerProfile = HandlerProfile {
    id: "analysis",
    system_prompt: "You are a specialized data analysis and computational AI assistant. \
        You excel at data analysis and interpretation, mathematical calculations, \
        statistical analysis, and explaining quantitative results step by step.",
    include_history: true,
    input_preamble: None,
    temperature: None,
};

pub const GRADING: HandlerProfile = HandlerProfile {
    id: "grading",
    system_prompt: "You are a specialized educational assessment and grading AI assistant. \
        Grade the submission against a clear rubric. Give a score for each criterion, \
        justify it, and finish with an overall grade and concrete suggestions.",
    include_history: true,
    input_preamble: None,
    temperature: None,
};

pub const FORMATTING: HandlerProfile = HandlerProfile {
    id: "formatting",
    system_prompt: "You turn grading results into a clean, professional markdown report \
        with a summary, a per-criterion table, strengths, areas for improvement and the \
        final grade. Do not change any score.",
    include_history: false,
    input_preamble: Some("Format as professional grading report:"),
    temperature: None,
};

pub const CODE_REVIEW: HandlerProfile = HandlerProfile {
    id: "code_review",
    system_prompt: "You are a specialized code review AI assistant. Review the code for \
        correctness, security issues, performance problems and readability. Point to \
        specific lines and suggest concrete fixes.",
    include_history: true,
    input_preamble: None,
    temperature: Some(0.3),
};

/// An `AgentHandler` that prompts an LLM with a fixed profile.
pub struct PromptHandler {
    profile: HandlerProfile,
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl PromptHandler {
    pub fn new(profile: HandlerProfile, llm: Arc<dyn LlmClient>, config: &ModelConfig) -> Self {
        let config = match profile.temperature {
            Some(temperature) => config.with_temperature(temperature),
            None => config.clone(),
        };
        Self { profile, llm, config }
    }

    pub fn profile(&self) -> &HandlerProfile {
        &self.profile
    }

    /// System prompt, then history (when the profile wants it), then the input.
    pub fn build_messages(&self, input: &str, history: &[ChatMessage]) -> Vec<Message> {
        let mut messages = vec![Message::system(self.profile.system_prompt)];
        if self.profile.include_history {
            messages.extend(to_llm_messages(history));
        }
        let user = match self.profile.input_preamble {
            Some(preamble) => format!("{}\n\n{}", preamble, input),
            None => input.to_string(),
        };
        messages.push(Message::user(user));
        messages
    }

    fn wrap_error(&self, error: MaestroError) -> MaestroError {
        match error {
            MaestroError::Handler { .. } => error,
            other => MaestroError::Handler {
                handler: self.profile.id.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl AgentHandler for PromptHandler {
    fn id(&self) -> HandlerId {
        HandlerId::new(self.profile.id)
    }

    fn process(&self, input: String, history: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let messages = self.build_messages(&input, &history);
            debug!(handler = self.profile.id, messages = messages.len(), "Handler request");
            self.llm
                .chat(&self.config, messages)
                .await
                .map_err(|e| self.wrap_error(e))
        })
    }

    fn stream_process(
        &self,
        input: String,
        history: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        use futures::StreamExt;

        Box::pin(async move {
            let messages = self.build_messages(&input, &history);
            debug!(handler = self.profile.id, messages = messages.len(), "Handler stream request");
            let fragments = self
                .llm
                .chat_stream(&self.config, messages)
                .await
                .map_err(|e| self.wrap_error(e))?;
            Ok(fragments.map(move |fragment| fragment.map_err(|e| self.wrap_error(e))).boxed())
        })
    }
}
