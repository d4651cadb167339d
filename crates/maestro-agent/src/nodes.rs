//! Node functions of the orchestration graph.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use maestro_core::error::{MaestroError, Result};
use maestro_core::traits::{AgentHandler, TaskClassifier};
use maestro_core::types::{ChatMessage, HandlerId, StreamEvent, TaskCategory};
use maestro_memory::{ConversationHistory, Interaction, InteractionLog, StreamTicket};

use crate::graph::{ErrorKind, NodeId, NodeRunner, PersistenceWarning, RequestState, Workflow};
use crate::handlers::HandlerRegistry;

pub const NOTES_SEPARATOR: &str = "\n\n---\n\n**Additional notes**\n\n";

const APOLOGY: &str = "I apologize, but I encountered an error";

/// Per-orchestrator knobs the nodes read.
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub max_related: usize,
    pub scan_window: usize,
    /// Lowercased.
    pub annotate_keywords: Vec<String>,
}

pub(crate) fn context_suffix(related: usize) -> String {
    format!("\n\n[Context: Based on {} previous interactions]", related)
}

fn annotate_prompt(report: &str, request: &str) -> String {
    format!(
        "Write additional notes for the student based on this grading report. \
         Focus on actionable feedback and next steps.\n\nReport:\n{}\n\nOriginal request:\n{}",
        report, request
    )
}

fn failure_detail(error: &MaestroError) -> String {
    match error {
        MaestroError::Handler { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Relays handler fragments to a streaming caller.
pub(crate) struct EventSink<'a> {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    history: &'a ConversationHistory,
    /// The history accumulator this run mirrors chunks into.
    ticket: Option<StreamTicket>,
}

impl<'a> EventSink<'a> {
    pub fn new(tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken, history: &'a ConversationHistory) -> Self {
        Self {
            tx,
            cancel,
            history,
            ticket: None,
        }
    }

    /// Send an event, failing with `Cancelled` once the caller is gone.
    pub async fn send(&self, event: StreamEvent) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MaestroError::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| MaestroError::Cancelled),
        }
    }

    pub async fn chunk(&mut self, fragment: &str, agent: &HandlerId) -> Result<()> {
        self.send(StreamEvent::chunk(fragment, agent.clone())).await?;
        if let Some(ticket) = self.ticket {
            if let Err(e) = self.history.append_chunk_to(ticket, fragment) {
                warn!(error = %e, "History accumulator lost, reply will be appended on completion");
                self.ticket = None;
            }
        }
        Ok(())
    }

    fn begin_accumulating(&mut self, handler: HandlerId) {
        match self.history.start_streaming(handler) {
            Ok(ticket) => self.ticket = Some(ticket),
            Err(e) => debug!(error = %e, "History accumulator busy, reply will be appended on completion"),
        }
    }

    /// Store the accumulated reply. Returns false when this run holds no
    /// accumulator, so the caller appends the reply itself.
    pub fn finalize(&mut self) -> bool {
        match self.ticket.take() {
            Some(ticket) => self.history.finalize_stream(ticket).is_ok(),
            None => false,
        }
    }

    /// Discard any partial message this run accumulated.
    pub fn abort(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.history.cancel_stream(ticket);
        }
    }

    /// Wait for `future` unless the run is cancelled first.
    async fn guard<T>(&self, future: impl std::future::Future<Output = T>) -> Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MaestroError::Cancelled),
            _ = self.tx.closed() => Err(MaestroError::Cancelled),
            value = future => Ok(value),
        }
    }

    /// Stream one handler invocation as `status`, `chunk`*, `complete`.
    ///
    /// The outer `Result` is fatal (cancellation); the inner one is the
    /// handler's own outcome.
    async fn relay(
        &mut self,
        handler: &dyn AgentHandler,
        input: String,
        history: Vec<ChatMessage>,
        primary: bool,
    ) -> Result<Result<String>> {
        let id = handler.id();
        self.send(StreamEvent::status(format!("Processing with {} agent...", id), id.clone()))
            .await?;
        if primary {
            self.begin_accumulating(id.clone());
        }

        let mut fragments = match self.guard(handler.stream_process(input, history)).await? {
            Ok(fragments) => fragments,
            Err(e) => return Ok(Err(e)),
        };

        let mut text = String::new();
        while let Some(next) = self.guard(fragments.next()).await? {
            match next {
                Ok(fragment) => {
                    self.chunk(&fragment, &id).await?;
                    text.push_str(&fragment);
                }
                Err(e) => return Ok(Err(e)),
            }
        }

        self.send(StreamEvent::complete(text.clone(), id)).await?;
        Ok(Ok(text))
    }
}

/// Runs the nodes of one request.
pub(crate) struct RequestRunner<'a> {
    registry: &'a HandlerRegistry,
    classifier: &'a dyn TaskClassifier,
    interactions: Option<&'a InteractionLog>,
    settings: &'a RunSettings,
    /// History as it was before this request.
    history: Vec<ChatMessage>,
    sink: Option<EventSink<'a>>,
}

impl<'a> RequestRunner<'a> {
    pub fn new(
        registry: &'a HandlerRegistry,
        classifier: &'a dyn TaskClassifier,
        interactions: Option<&'a InteractionLog>,
        settings: &'a RunSettings,
        history: Vec<ChatMessage>,
    ) -> Self {
        Self {
            registry,
            classifier,
            interactions,
            settings,
            history,
            sink: None,
        }
    }

    pub fn streaming(mut self, sink: EventSink<'a>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn into_sink(self) -> Option<EventSink<'a>> {
        self.sink
    }

    async fn classify_task(&mut self, state: &mut RequestState) -> Result<()> {
        let node = NodeId::ClassifyTask;
        if state.input().trim().is_empty() {
            state.fail(node, ErrorKind::Validation, "Empty input provided");
            return Ok(());
        }

        let label = match self
            .classifier
            .classify(state.input().to_string(), &TaskCategory::ALL)
            .await
        {
            Ok(label) => label,
            Err(e) => {
                warn!(error = %e, "Task classification failed");
                state.fail(node, ErrorKind::Handler, format!("Error classifying task: {}", failure_detail(&e)));
                return Ok(());
            }
        };

        let category = match TaskCategory::from_label(&label) {
            Some(category) => category,
            None => {
                let fallback = TaskCategory::default();
                warn!(label = %label, fallback = %fallback, "Classifier returned an unknown category");
                state.classification_fallback = true;
                fallback
            }
        };
        state.classification = Some(category);

        if category == TaskCategory::Grading {
            let lowered = state.input().to_lowercase();
            let annotate = self
                .settings
                .annotate_keywords
                .iter()
                .any(|keyword| lowered.contains(keyword.as_str()));
            state.workflow = Workflow::Grading { annotate };
        } else {
            state.selected_handler = Some(HandlerId::from(category));
        }

        info!(category = %category, workflow = ?state.workflow, "Task classified");
        Ok(())
    }

    /// Run one handler and record its output or failure in `state`.
    async fn invoke(
        &mut self,
        node: NodeId,
        handler: Arc<dyn AgentHandler>,
        input: String,
        history: Vec<ChatMessage>,
        primary: bool,
        state: &mut RequestState,
    ) -> Result<()> {
        let id = handler.id();
        info!(node_id = %node, handler = %id, "Invoking handler");

        let outcome = match self.sink.as_mut() {
            Some(sink) => sink.relay(&*handler, input, history, primary).await?,
            None => handler.process(input, history).await,
        };

        match outcome {
            Ok(text) => {
                debug!(node_id = %node, handler = %id, chars = text.len(), "Handler finished");
                state.record_output(id, node, text);
            }
            Err(e) => {
                warn!(node_id = %node, handler = %id, error = %e, "Handler failed");
                state.fail(
                    node,
                    ErrorKind::Handler,
                    format!("Error in {} agent: {}", id, failure_detail(&e)),
                );
            }
        }
        Ok(())
    }

    async fn route_to_agent(&mut self, state: &mut RequestState) -> Result<()> {
        let handler = self.registry.for_category(state.classification.unwrap_or_default());
        state.selected_handler = Some(handler.id());
        let history = self.history.clone();
        self.invoke(NodeId::RouteToAgent, handler, state.input().to_string(), history, true, state)
            .await
    }

    async fn run_grading(&mut self, state: &mut RequestState) -> Result<()> {
        let handler = self.registry.for_category(TaskCategory::Grading);
        let history = self.history.clone();
        self.invoke(NodeId::RunGrading, handler, state.input().to_string(), history, false, state)
            .await
    }

    async fn run_formatting(&mut self, state: &mut RequestState) -> Result<()> {
        let node = NodeId::RunFormatting;
        let Some(grading) = state.primary_output().map(|output| output.text.clone()) else {
            return Err(MaestroError::Graph(format!("'{}' reached without a grading result", node)));
        };
        let handler = self.registry.resolve(&HandlerId::formatting());
        state.selected_handler = Some(handler.id());
        self.invoke(node, handler, grading, Vec::new(), true, state).await
    }

    async fn run_notes(&mut self, state: &mut RequestState) -> Result<()> {
        let node = NodeId::RunNotes;
        let Some(report) = state.primary_output().map(|output| output.text.clone()) else {
            return Err(MaestroError::Graph(format!("'{}' reached without a report", node)));
        };
        if let Some(sink) = self.sink.as_mut() {
            sink.chunk(NOTES_SEPARATOR, &HandlerId::master()).await?;
        }
        let handler = self.registry.for_category(TaskCategory::Chat);
        let prompt = annotate_prompt(&report, state.input());
        self.invoke(node, handler, prompt, Vec::new(), false, state).await
    }

    async fn manage_data(&mut self, state: &mut RequestState) -> Result<()> {
        let node = NodeId::ManageData;
        let Some(log) = self.interactions else {
            debug!("No interaction log attached");
            return Ok(());
        };

        // Look up before recording so the current request never counts itself
        match log
            .relevant(state.input(), self.settings.max_related, self.settings.scan_window)
            .await
        {
            Ok(related) => state.related = related,
            Err(e) => {
                warn!(error = %e, "Failed to retrieve related interactions");
                state.warnings.push(PersistenceWarning {
                    node,
                    message: format!("retrieval failed: {}", e),
                });
            }
        }

        let interaction = Interaction::new(state.input(), state.task_type(), state.responses());
        if let Err(e) = log.record(&interaction).await {
            warn!(error = %e, "Failed to record interaction");
            state.warnings.push(PersistenceWarning {
                node,
                message: format!("store failed: {}", e),
            });
        }

        info!(related = state.related.len(), warnings = state.warnings.len(), "Data management completed");
        Ok(())
    }

    async fn synthesize_response(&mut self, state: &mut RequestState) -> Result<()> {
        let Some(primary) = state.primary_output() else {
            return Err(MaestroError::Graph("no handler output to synthesize".into()));
        };

        let mut response = primary.text.clone();
        if let Some(notes) = state.notes_output() {
            response.push_str(NOTES_SEPARATOR);
            response.push_str(&notes.text);
        }
        if !state.related.is_empty() {
            let suffix = context_suffix(state.related.len());
            if let Some(sink) = self.sink.as_mut() {
                sink.chunk(&suffix, &HandlerId::master()).await?;
            }
            response.push_str(&suffix);
        }

        state.final_response = Some(response);
        Ok(())
    }

    fn handle_error(&mut self, state: &mut RequestState) -> Result<()> {
        let Some(error) = state.error.as_mut() else {
            return Err(MaestroError::Graph("handle_error reached without an error".into()));
        };
        warn!(node_id = %error.node, kind = ?error.kind, message = %error.message, "Request failed");
        error.user_message = Some(format!("{}: {}", APOLOGY, error.message));
        Ok(())
    }
}

impl NodeRunner for RequestRunner<'_> {
    fn run<'b>(&'b mut self, node: NodeId, state: &'b mut RequestState) -> BoxFuture<'b, Result<()>> {
        Box::pin(async move {
            match node {
                NodeId::ClassifyTask => self.classify_task(state).await,
                NodeId::RouteToAgent => self.route_to_agent(state).await,
                NodeId::RunGrading => self.run_grading(state).await,
                NodeId::RunFormatting => self.run_formatting(state).await,
                NodeId::RunNotes => self.run_notes(state).await,
                NodeId::ManageData => self.manage_data(state).await,
                NodeId::SynthesizeResponse => self.synthesize_response(state).await,
                NodeId::HandleError => self.handle_error(state),
            }
        })
    }
}
