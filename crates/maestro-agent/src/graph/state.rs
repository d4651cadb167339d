use serde::Serialize;

use maestro_core::types::{HandlerId, ResponseMap, TaskCategory};
use maestro_memory::Interaction;

use super::node::NodeId;

/// Which chain of handler nodes a request runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workflow {
    /// classify, one handler, synthesize.
    #[default]
    Standard,
    /// grade, format, then optionally annotate with notes.
    Grading { annotate: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Handler,
}

/// An expected failure recorded by a node. Routes the run to `handle_error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub node: NodeId,
    pub kind: ErrorKind,
    pub message: String,
    /// Filled by `handle_error`.
    pub user_message: Option<String>,
}

/// A non-fatal failure of the persistence step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceWarning {
    pub node: NodeId,
    pub message: String,
}

/// Output of one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerOutput {
    pub handler: HandlerId,
    pub node: NodeId,
    pub text: String,
}

/// Mutable state of one request, threaded through the graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestState {
    input: String,
    pub classification: Option<TaskCategory>,
    pub classification_fallback: bool,
    pub workflow: Workflow,
    pub selected_handler: Option<HandlerId>,
    /// In execution order.
    pub handler_outputs: Vec<HandlerOutput>,
    pub workflow_path: Vec<NodeId>,
    pub error: Option<ErrorInfo>,
    pub final_response: Option<String>,
    #[serde(skip)]
    pub related: Vec<Interaction>,
    pub warnings: Vec<PersistenceWarning>,
    pub persist_interaction: bool,
}

impl RequestState {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist_interaction = persist;
        self
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn fail(&mut self, node: NodeId, kind: ErrorKind, message: impl Into<String>) {
        self.error = Some(ErrorInfo {
            node,
            kind,
            message: message.into(),
            user_message: None,
        });
    }

    pub fn record_output(&mut self, handler: HandlerId, node: NodeId, text: impl Into<String>) {
        self.handler_outputs.push(HandlerOutput {
            handler,
            node,
            text: text.into(),
        });
    }

    /// The last handler output that is not an annotation.
    pub fn primary_output(&self) -> Option<&HandlerOutput> {
        self.handler_outputs
            .iter()
            .rev()
            .find(|output| output.node != NodeId::RunNotes)
    }

    pub fn notes_output(&self) -> Option<&HandlerOutput> {
        self.handler_outputs
            .iter()
            .find(|output| output.node == NodeId::RunNotes)
    }

    /// Handler outputs keyed by handler id; a repeated id keeps its first
    /// position and its last text.
    pub fn responses(&self) -> ResponseMap {
        let mut map = ResponseMap::new();
        for output in &self.handler_outputs {
            map.insert(output.handler.clone(), output.text.clone());
        }
        map
    }

    /// Task type as stored in the interaction log.
    pub fn task_type(&self) -> &'static str {
        self.classification.unwrap_or_default().as_str()
    }

    /// The reply the caller sees: the final response, or the apology set by
    /// `handle_error`.
    pub fn reply(&self) -> Option<&str> {
        match (&self.final_response, &self.error) {
            (Some(response), None) => Some(response),
            (None, Some(error)) => error.user_message.as_deref(),
            _ => None,
        }
    }
}
