use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Streaming text-generation backend.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of text fragments.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;

    /// Send a chat request and wait for the complete reply.
    fn chat(&self, config: &ModelConfig, messages: Vec<Message>) -> BoxFuture<'_, Result<String>> {
        let config = config.clone();
        Box::pin(async move {
            let mut fragments = self.chat_stream(&config, messages).await?;
            let mut reply = String::new();
            while let Some(fragment) = fragments.next().await {
                reply.push_str(&fragment?);
            }
            Ok(reply)
        })
    }
}

/// A specialized handler that turns a request into a reply.
pub trait AgentHandler: Send + Sync + 'static {
    /// Handler id, used for routing, events and history attribution.
    fn id(&self) -> HandlerId;

    /// Produce the complete reply.
    fn process(&self, input: String, history: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>>;

    /// Produce the reply as a finite stream of fragments.
    ///
    /// Handlers without an incremental backend get a single fragment
    /// wrapping `process`.
    fn stream_process(
        &self,
        input: String,
        history: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            let reply = self.process(input, history).await?;
            Ok(stream::once(async move { Ok(reply) }).boxed())
        })
    }
}

/// Maps a request onto a raw category label.
///
/// Interpreting the label (closed set, fallback) is up to the caller.
pub trait TaskClassifier: Send + Sync + 'static {
    fn classify(&self, input: String, categories: &[TaskCategory]) -> BoxFuture<'_, Result<String>>;
}

/// Input validation applied before a request is admitted.
pub trait InputValidator: Send + Sync + 'static {
    /// Reject malformed or unsafe input with `MaestroError::Validation`.
    fn validate(&self, input: &str) -> Result<()>;

    /// Normalize accepted input.
    fn sanitize(&self, input: &str) -> String {
        input.trim().to_string()
    }
}
