pub mod edge;
pub mod executor;
pub mod node;
pub mod state;

pub use edge::{EdgeLabel, GraphBuilder, Router, Target, Topology};
pub use executor::{Graph, NodeRunner};
pub use node::NodeId;
pub use state::{ErrorInfo, ErrorKind, HandlerOutput, PersistenceWarning, RequestState, Workflow};

use maestro_core::error::Result;

fn after_classify(state: &RequestState) -> EdgeLabel {
    if state.has_error() {
        EdgeLabel::Error
    } else if matches!(state.workflow, Workflow::Grading { .. }) {
        EdgeLabel::Workflow
    } else {
        EdgeLabel::Route
    }
}

fn after_handler(state: &RequestState) -> EdgeLabel {
    if state.has_error() {
        EdgeLabel::Error
    } else if state.persist_interaction {
        EdgeLabel::Data
    } else {
        EdgeLabel::Synthesize
    }
}

fn after_grading(state: &RequestState) -> EdgeLabel {
    if state.has_error() {
        EdgeLabel::Error
    } else {
        EdgeLabel::Next
    }
}

fn after_formatting(state: &RequestState) -> EdgeLabel {
    match state.workflow {
        _ if state.has_error() => EdgeLabel::Error,
        Workflow::Grading { annotate: true } => EdgeLabel::Annotate,
        _ => after_handler(state),
    }
}

pub const CLASSIFY_ROUTER: Router = Router {
    name: "after_classify",
    labels: &[EdgeLabel::Error, EdgeLabel::Route, EdgeLabel::Workflow],
    route: after_classify,
};

pub const HANDLER_ROUTER: Router = Router {
    name: "after_handler",
    labels: &[EdgeLabel::Error, EdgeLabel::Data, EdgeLabel::Synthesize],
    route: after_handler,
};

pub const GRADING_ROUTER: Router = Router {
    name: "after_grading",
    labels: &[EdgeLabel::Error, EdgeLabel::Next],
    route: after_grading,
};

pub const FORMATTING_ROUTER: Router = Router {
    name: "after_formatting",
    labels: &[EdgeLabel::Error, EdgeLabel::Annotate, EdgeLabel::Data, EdgeLabel::Synthesize],
    route: after_formatting,
};

/// The orchestration graph every request runs through.
///
/// ```text
/// classify_task  -> error: handle_error | route: route_to_agent | workflow: run_grading
/// route_to_agent -> error: handle_error | data: manage_data | synthesize: synthesize_response
/// run_grading    -> error: handle_error | next: run_formatting
/// run_formatting -> error | annotate: run_notes | data | synthesize
/// run_notes      -> error | data | synthesize
/// manage_data    -> synthesize_response
/// ```
pub fn orchestration_graph() -> Result<Graph> {
    use NodeId::*;

    let to_error = (EdgeLabel::Error, Target::Node(HandleError));
    let to_data = (EdgeLabel::Data, Target::Node(ManageData));
    let to_synthesis = (EdgeLabel::Synthesize, Target::Node(SynthesizeResponse));

    let topology = GraphBuilder::new(ClassifyTask)
        .node(ClassifyTask)
        .node(RouteToAgent)
        .node(RunGrading)
        .node(RunFormatting)
        .node(RunNotes)
        .node(ManageData)
        .node(SynthesizeResponse)
        .node(HandleError)
        .conditional(
            ClassifyTask,
            CLASSIFY_ROUTER,
            &[
                to_error,
                (EdgeLabel::Route, Target::Node(RouteToAgent)),
                (EdgeLabel::Workflow, Target::Node(RunGrading)),
            ],
        )
        .conditional(RouteToAgent, HANDLER_ROUTER, &[to_error, to_data, to_synthesis])
        .conditional(
            RunGrading,
            GRADING_ROUTER,
            &[to_error, (EdgeLabel::Next, Target::Node(RunFormatting))],
        )
        .conditional(
            RunFormatting,
            FORMATTING_ROUTER,
            &[
                to_error,
                (EdgeLabel::Annotate, Target::Node(RunNotes)),
                to_data,
                to_synthesis,
            ],
        )
        .conditional(RunNotes, HANDLER_ROUTER, &[to_error, to_data, to_synthesis])
        .edge(ManageData, Target::Node(SynthesizeResponse))
        .edge(SynthesizeResponse, Target::End)
        .edge(HandleError, Target::End)
        .build()?;

    Ok(Graph::new(topology))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestration_graph_is_valid() {
        let graph = orchestration_graph().unwrap();
        assert_eq!(graph.topology().entry(), NodeId::ClassifyTask);
        assert_eq!(graph.topology().node_count(), 8);
    }

    #[test]
    fn test_routers_return_declared_labels() {
        let mut state = RequestState::new("x").with_persistence(true);
        for router in [CLASSIFY_ROUTER, HANDLER_ROUTER, GRADING_ROUTER, FORMATTING_ROUTER] {
            assert!(router.labels.contains(&(router.route)(&state)));
        }
        state.workflow = Workflow::Grading { annotate: true };
        assert_eq!(after_classify(&state), EdgeLabel::Workflow);
        assert_eq!(after_formatting(&state), EdgeLabel::Annotate);

        state.fail(NodeId::RunFormatting, ErrorKind::Handler, "x");
        assert_eq!(after_formatting(&state), EdgeLabel::Error);
    }

    #[test]
    fn test_handler_router_skips_data_without_log() {
        let state = RequestState::new("x");
        assert_eq!(after_handler(&state), EdgeLabel::Synthesize);
        assert_eq!(after_formatting(&state), EdgeLabel::Synthesize);
        assert_eq!(after_classify(&state), EdgeLabel::Route);
    }
}
