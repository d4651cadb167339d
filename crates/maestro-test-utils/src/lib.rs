//! Shared mocks and fixtures for Maestro tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use maestro_core::config::ModelConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{AgentHandler, LlmClient, TaskClassifier};
use maestro_core::types::{ChatMessage, HandlerId, Message, TaskCategory};

/// Shared view of how many times a mock was called.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

enum Scripted {
    Fragments(Vec<String>),
    Fail(String),
    FailMidStream(Vec<String>, String),
    Hang,
    StallAfter(Vec<String>),
}

/// Scripted LLM. Each call pops the next scripted reply; once the script
/// is exhausted the default reply (if any) is returned.
#[derive(Default)]
pub struct MockLlm {
    script: Mutex<VecDeque<Scripted>>,
    calls: CallCounter,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, item: Scripted) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(Scripted::Fragments(vec![text.into()]))
    }

    pub fn with_fragments(self, fragments: Vec<String>) -> Self {
        self.push(Scripted::Fragments(fragments))
    }

    /// Fail the call with `MaestroError::LlmRequest(message)`.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Fail(message.into()))
    }

    /// Yield some fragments, then a stream error.
    pub fn with_mid_stream_failure(self, fragments: Vec<String>, message: impl Into<String>) -> Self {
        self.push(Scripted::FailMidStream(fragments, message.into()))
    }

    /// Never resolve the call.
    pub fn with_hang(self) -> Self {
        self.push(Scripted::Hang)
    }

    /// Yield some fragments, then never produce another one.
    pub fn with_stall_after(self, fragments: Vec<String>) -> Self {
        self.push(Scripted::StallAfter(fragments))
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }

    /// Shared log of the prompts this mock received.
    pub fn request_log(&self) -> Arc<Mutex<Vec<Vec<Message>>>> {
        self.requests.clone()
    }

    fn next_scripted(&self) -> Option<Scripted> {
        self.script.lock().ok().and_then(|mut s| s.pop_front())
    }
}

fn fragments_stream(fragments: Vec<String>) -> BoxStream<'static, Result<String>> {
    stream::iter(fragments.into_iter().map(Ok)).boxed()
}

impl LlmClient for MockLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<Message>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        self.calls.bump();
        if let Ok(mut log) = self.requests.lock() {
            log.push(messages);
        }
        let next = self.next_scripted();

        Box::pin(async move {
            match next {
                Some(Scripted::Fragments(fragments)) => Ok(fragments_stream(fragments)),
                Some(Scripted::Fail(message)) => Err(MaestroError::LlmRequest(message)),
                Some(Scripted::FailMidStream(fragments, message)) => {
                    let tail = stream::once(async move { Err(MaestroError::LlmStream(message)) });
                    Ok(fragments_stream(fragments).chain(tail).boxed())
                }
                Some(Scripted::Hang) => futures::future::pending().await,
                Some(Scripted::StallAfter(fragments)) => {
                    Ok(fragments_stream(fragments).chain(stream::pending()).boxed())
                }
                None => Err(MaestroError::LlmRequest("mock script exhausted".into())),
            }
        })
    }
}

/// Classifier that always answers with the same raw label.
pub struct FixedClassifier {
    label: String,
    calls: CallCounter,
}

impl FixedClassifier {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            calls: CallCounter::default(),
        }
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl TaskClassifier for FixedClassifier {
    fn classify(&self, _input: String, _categories: &[TaskCategory]) -> BoxFuture<'_, Result<String>> {
        self.calls.bump();
        let label = self.label.clone();
        Box::pin(async move { Ok(label) })
    }
}

/// Classifier that always fails.
pub struct FailingClassifier;

impl TaskClassifier for FailingClassifier {
    fn classify(&self, _input: String, _categories: &[TaskCategory]) -> BoxFuture<'_, Result<String>> {
        Box::pin(async { Err(MaestroError::Classification("classifier unavailable".into())) })
    }
}

/// Handler that replies with fixed fragments and records what it saw.
pub struct StaticHandler {
    id: HandlerId,
    fragments: Vec<String>,
    calls: CallCounter,
    seen: Arc<Mutex<Vec<(String, usize)>>>,
}

impl StaticHandler {
    pub fn new(id: &str, reply: &str) -> Self {
        Self::with_fragments(id, &[reply])
    }

    pub fn with_fragments(id: &str, fragments: &[&str]) -> Self {
        Self {
            id: HandlerId::new(id),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            calls: CallCounter::default(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }

    /// Inputs received, each with the length of the history it was given.
    pub fn seen(&self) -> Arc<Mutex<Vec<(String, usize)>>> {
        self.seen.clone()
    }

    fn record(&self, input: &str, history: &[ChatMessage]) {
        self.calls.bump();
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((input.to_string(), history.len()));
        }
    }
}

impl AgentHandler for StaticHandler {
    fn id(&self) -> HandlerId {
        self.id.clone()
    }

    fn process(&self, input: String, history: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        self.record(&input, &history);
        let reply = self.fragments.concat();
        Box::pin(async move { Ok(reply) })
    }

    fn stream_process(
        &self,
        input: String,
        history: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        self.record(&input, &history);
        let fragments = self.fragments.clone();
        Box::pin(async move { Ok(fragments_stream(fragments)) })
    }
}

/// Handler whose every invocation fails.
pub struct FailingHandler {
    id: HandlerId,
    message: String,
}

impl FailingHandler {
    pub fn new(id: &str, message: &str) -> Self {
        Self {
            id: HandlerId::new(id),
            message: message.to_string(),
        }
    }
}

impl AgentHandler for FailingHandler {
    fn id(&self) -> HandlerId {
        self.id.clone()
    }

    fn process(&self, _input: String, _history: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        let err = MaestroError::Handler {
            handler: self.id.to_string(),
            message: self.message.clone(),
        };
        Box::pin(async move { Err(err) })
    }
}

/// Handler that streams slowly, one fragment per `delay`.
pub struct SlowHandler {
    id: HandlerId,
    fragments: Vec<String>,
    delay: std::time::Duration,
}

impl SlowHandler {
    pub fn new(id: &str, fragments: &[&str], delay: std::time::Duration) -> Self {
        Self {
            id: HandlerId::new(id),
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            delay,
        }
    }
}

impl AgentHandler for SlowHandler {
    fn id(&self) -> HandlerId {
        self.id.clone()
    }

    fn process(&self, _input: String, _history: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        let reply = self.fragments.concat();
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(reply)
        })
    }

    fn stream_process(
        &self,
        _input: String,
        _history: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        let delay = self.delay;
        let fragments = stream::iter(self.fragments.clone()).then(move |fragment| async move {
            tokio::time::sleep(delay).await;
            Ok(fragment)
        });
        Box::pin(async move { Ok(fragments.boxed()) })
    }
}
