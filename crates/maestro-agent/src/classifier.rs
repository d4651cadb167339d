use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use maestro_core::config::ModelConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{LlmClient, TaskClassifier};
use maestro_core::types::{Message, TaskCategory};

const SYSTEM_PROMPT: &str = "You are a task classifier. Respond with only the category name.";

fn describe(category: TaskCategory) -> &'static str {
    match category {
        TaskCategory::Chat => "General conversation, questions, or assistance",
        TaskCategory::Analysis => "Data analysis, file processing, or computational tasks",
        TaskCategory::Grading => "Educational assessment, grading, or evaluation tasks",
        TaskCategory::CodeReview => "Code review, refactoring, or code quality analysis",
    }
}

/// Asks the LLM which category a request belongs to.
///
/// Returns the reply trimmed and lowercased; mapping it onto a category is
/// left to the caller.
pub struct LlmClassifier {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmClient>, config: &ModelConfig) -> Self {
        Self {
            llm,
            config: config.clone(),
        }
    }

    pub fn build_prompt(input: &str, categories: &[TaskCategory]) -> String {
        let mut prompt = String::from("Classify the following user request into one of these categories:\n");
        for category in categories {
            prompt.push_str(&format!("- {}: {}\n", category, describe(*category)));
        }
        let names: Vec<&str> = categories.iter().map(|c| c.as_str()).collect();
        prompt.push_str(&format!(
            "\nUser request: \"{}\"\n\nRespond with only the category name ({}).",
            input,
            names.join(", ")
        ));
        prompt
    }
}

impl TaskClassifier for LlmClassifier {
    fn classify(&self, input: String, categories: &[TaskCategory]) -> BoxFuture<'_, Result<String>> {
        let messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(Self::build_prompt(&input, categories)),
        ];
        Box::pin(async move {
            let reply = self
                .llm
                .chat(&self.config, messages)
                .await
                .map_err(|e| MaestroError::Classification(e.to_string()))?;
            let label = reply.trim().to_lowercase();
            debug!(label = %label, "Classifier replied");
            Ok(label)
        })
    }
}
