use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use maestro_core::config::AppConfig;
use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{InputValidator, TaskClassifier};
use maestro_core::types::{HandlerId, StreamEvent};
use maestro_memory::{ConversationHistory, InteractionLog, ResponseCache};

use crate::graph::{orchestration_graph, Graph, RequestState};
use crate::handlers::HandlerRegistry;
use crate::metrics::RequestMetrics;
use crate::nodes::{EventSink, RequestRunner, RunSettings};
use crate::rate_limit::RateLimiter;
use crate::validation::DefaultValidator;

/// Caller identifier used when none is given.
pub const DEFAULT_CALLER: &str = "default";

/// Outcome of `Orchestrator::execute`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub reply: String,
    /// `None` when the reply came from the cache.
    pub state: Option<RequestState>,
}

impl RunReport {
    pub fn is_cached(&self) -> bool {
        self.state.is_none()
    }
}

const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred while processing your request.";

/// Final event of a stream whose run aborted on an orchestrator fault.
fn fault_event() -> StreamEvent {
    StreamEvent::error(INTERNAL_ERROR_MESSAGE, HandlerId::system())
}

/// Runs requests through the orchestration graph.
///
/// Cheap to clone; clones share history, cache, rate limiter and log.
#[derive(Clone)]
pub struct Orchestrator {
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    classifier: Arc<dyn TaskClassifier>,
    validator: Arc<dyn InputValidator>,
    history: Arc<ConversationHistory>,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    interactions: Option<Arc<InteractionLog>>,
    metrics: Arc<RequestMetrics>,
    settings: Arc<RunSettings>,
    autosave: bool,
    stream_buffer: usize,
}

impl Orchestrator {
    pub fn new(registry: HandlerRegistry, classifier: Arc<dyn TaskClassifier>, config: &AppConfig) -> Result<Self> {
        let cache = if config.cache.enabled {
            ResponseCache::new(Duration::from_secs(config.cache.ttl_secs), config.cache.max_size)
        } else {
            ResponseCache::disabled()
        };
        let interactions = config
            .data
            .enabled
            .then(|| Arc::new(InteractionLog::new(config.data.interactions_file.clone())));
        let history = ConversationHistory::new(config.history.max_messages).with_storage(config.history.file.clone());

        Ok(Self {
            graph: Arc::new(orchestration_graph()?),
            registry: Arc::new(registry),
            classifier,
            validator: Arc::new(DefaultValidator::from_config(&config.input)?),
            history: Arc::new(history),
            cache: Arc::new(cache),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            interactions,
            metrics: Arc::new(RequestMetrics::new()),
            settings: Arc::new(RunSettings {
                max_related: config.data.max_related,
                scan_window: config.data.scan_window,
                annotate_keywords: config
                    .workflow
                    .annotate_keywords
                    .iter()
                    .map(|k| k.to_lowercase())
                    .collect(),
            }),
            autosave: config.history.autosave,
            stream_buffer: config.workflow.stream_buffer.max(1),
        })
    }

    pub fn with_history(mut self, history: ConversationHistory) -> Self {
        self.history = Arc::new(history);
        self
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_interactions(mut self, log: Option<InteractionLog>) -> Self {
        self.interactions = log.map(Arc::new);
        self
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn interactions(&self) -> Option<&InteractionLog> {
        self.interactions.as_deref()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Restore history from its file, if one is configured.
    pub async fn load_history(&self) -> Result<usize> {
        if self.history.storage_path().is_none() {
            return Ok(0);
        }
        self.history.load_from_disk().await
    }

    /// Run a request to completion and return the reply.
    pub async fn run(&self, input: &str) -> Result<String> {
        self.run_for(DEFAULT_CALLER, input).await
    }

    /// Like `run`, rate limited under `caller`.
    pub async fn run_for(&self, caller: &str, input: &str) -> Result<String> {
        Ok(self.execute(caller, input).await?.reply)
    }

    /// Run a request and keep the final request state for inspection.
    pub async fn execute(&self, caller: &str, input: &str) -> Result<RunReport> {
        let input = self.admit(caller, input)?;
        let fingerprint = self.fingerprint();
        if let Some(cached) = self.cache.lookup(&input, &fingerprint) {
            info!(chars = input.len(), "Cache hit");
            self.metrics.record_cache_hit();
            return Ok(RunReport {
                reply: cached,
                state: None,
            });
        }

        let started = Instant::now();
        let mut state = self.new_state(&input);
        let mut runner = self.runner();
        if let Err(e) = self.graph.execute(&mut runner, &mut state).await {
            error!(error = %e, "Request aborted");
            self.metrics.record(&HandlerId::system(), started.elapsed(), false);
            return Err(e);
        }

        let committed = self.commit(&input, &fingerprint, &state);
        self.record_outcome(&state, started);
        let reply = committed?;
        self.autosave().await;
        Ok(RunReport {
            reply,
            state: Some(state),
        })
    }

    /// Run a request and stream its progress.
    pub async fn run_streaming(&self, input: &str) -> Result<BoxStream<'static, StreamEvent>> {
        self.run_streaming_with(input, CancellationToken::new()).await
    }

    /// Like `run_streaming`; firing `cancel` stops the run at the next
    /// fragment, as does dropping the returned stream.
    ///
    /// Rejections (validation, rate limit) are returned before any event.
    /// A handler failure ends the stream with an `error` event from the
    /// `master` agent carrying the apology that was stored in history. A
    /// fault in the orchestrator itself ends it with an `error` event from
    /// the `system` agent, and nothing is stored.
    pub async fn run_streaming_with(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        self.run_streaming_for(DEFAULT_CALLER, input, cancel).await
    }

    /// Like `run_streaming_with`, rate limited under `caller`.
    pub async fn run_streaming_for(
        &self,
        caller: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, StreamEvent>> {
        let input = self.admit(caller, input)?;
        let fingerprint = self.fingerprint();

        if let Some(cached) = self.cache.lookup(&input, &fingerprint) {
            info!(chars = input.len(), "Cache hit");
            self.metrics.record_cache_hit();
            let master = HandlerId::master();
            let events = vec![
                StreamEvent::status("Retrieved from cache", master.clone()),
                StreamEvent::chunk(cached.clone(), master.clone()),
                StreamEvent::complete(cached, master),
            ];
            return Ok(stream::iter(events).boxed());
        }

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let this = self.clone();
        tokio::spawn(async move {
            this.drive_stream(input, fingerprint, tx, cancel).await;
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn drive_stream(
        &self,
        input: String,
        fingerprint: String,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let mut state = self.new_state(&input);
        let sink = EventSink::new(tx.clone(), cancel, &self.history);
        let mut runner = self.runner().streaming(sink);
        let outcome = self.graph.execute(&mut runner, &mut state).await;
        let Some(mut sink) = runner.into_sink() else {
            return;
        };

        if let Err(e) = outcome {
            sink.abort();
            match e {
                MaestroError::Cancelled => info!("Streaming request cancelled"),
                other => {
                    error!(error = %other, "Streaming request aborted");
                    self.metrics.record(&HandlerId::system(), started.elapsed(), false);
                    let _ = tx.send(fault_event()).await;
                }
            }
            return;
        }
        self.record_outcome(&state, started);

        let master = HandlerId::master();
        let final_event = match (&state.final_response, &state.error) {
            (Some(response), None) => {
                self.cache.store(&input, &fingerprint, response.clone());
                self.history.append_user(input.clone());
                if !sink.finalize() {
                    self.history.append_assistant(response.clone(), self.reply_handler(&state));
                }
                StreamEvent::complete(response.clone(), master)
            }
            (None, Some(failure)) => {
                sink.abort();
                let message = failure
                    .user_message
                    .clone()
                    .unwrap_or_else(|| INTERNAL_ERROR_MESSAGE.to_string());
                self.history.append_user(input.clone());
                self.history.append_assistant(message.clone(), HandlerId::error());
                StreamEvent::error(message, master)
            }
            // Ruled out by the graph executor
            _ => {
                sink.abort();
                fault_event()
            }
        };

        self.autosave().await;
        if tx.send(final_event).await.is_err() {
            debug!("Stream receiver dropped before the final event");
        }
    }

    /// Validate, sanitize and rate-limit a request.
    fn admit(&self, caller: &str, input: &str) -> Result<String> {
        self.validator.validate(input)?;
        let input = self.validator.sanitize(input);

        let admission = self.limiter.admit(caller);
        if !admission.allowed {
            warn!(caller, retry_after_secs = admission.retry_after.as_secs_f64(), "Request rate limited");
            return Err(MaestroError::RateLimited {
                retry_after_secs: admission.retry_after.as_secs_f64(),
            });
        }
        Ok(input)
    }

    /// Cache context: history length at request entry.
    fn fingerprint(&self) -> String {
        self.history.len().to_string()
    }

    fn new_state(&self, input: &str) -> RequestState {
        RequestState::new(input).with_persistence(self.interactions.is_some())
    }

    fn runner(&self) -> RequestRunner<'_> {
        RequestRunner::new(
            &self.registry,
            self.classifier.as_ref(),
            self.interactions.as_deref(),
            &self.settings,
            self.history.messages(),
        )
    }

    /// Count a run that reached the end of the graph against the handler
    /// that answered, or the one that failed.
    fn record_outcome(&self, state: &RequestState, started: Instant) {
        let success = state.error.is_none() && state.final_response.is_some();
        self.metrics.record(&self.reply_handler(state), started.elapsed(), success);
    }

    fn reply_handler(&self, state: &RequestState) -> HandlerId {
        state
            .selected_handler
            .clone()
            .unwrap_or_else(HandlerId::master)
    }

    /// Record a finished non-streaming run: cache successes, append both
    /// sides of the exchange to history.
    fn commit(&self, input: &str, fingerprint: &str, state: &RequestState) -> Result<String> {
        let (reply, handler) = match (&state.final_response, &state.error) {
            (Some(response), None) => {
                self.cache.store(input, fingerprint, response.clone());
                (response.clone(), self.reply_handler(state))
            }
            (None, Some(failure)) => {
                let message = failure
                    .user_message
                    .clone()
                    .ok_or_else(|| MaestroError::Graph("error reply was never prepared".into()))?;
                (message, HandlerId::error())
            }
            _ => return Err(MaestroError::Graph("run finished without an outcome".into())),
        };
        self.history.append_user(input);
        self.history.append_assistant(reply.clone(), handler);
        Ok(reply)
    }

    async fn autosave(&self) {
        if !self.autosave || self.history.storage_path().is_none() {
            return;
        }
        if let Err(e) = self.history.save_to_disk().await {
            warn!(error = %e, "Failed to save conversation history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::types::StreamEventKind;

    #[test]
    fn test_fault_event_is_tagged_system() {
        let event = fault_event();
        assert_eq!(event.kind, StreamEventKind::Error);
        assert_eq!(event.agent, HandlerId::system());
        assert_ne!(event.agent, HandlerId::master());
        assert_eq!(event.content, INTERNAL_ERROR_MESSAGE);
    }
}
