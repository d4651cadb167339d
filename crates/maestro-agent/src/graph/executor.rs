use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use maestro_core::error::{MaestroError, Result};

use super::edge::{Target, Topology, Transition};
use super::node::NodeId;
use super::state::RequestState;

/// Executes the work of individual nodes.
///
/// A node records expected failures in `state.error`; an `Err` return is a
/// fatal fault and aborts the run.
pub trait NodeRunner: Send {
    fn run<'a>(&'a mut self, node: NodeId, state: &'a mut RequestState) -> BoxFuture<'a, Result<()>>;
}

/// A validated topology ready to run requests.
#[derive(Debug)]
pub struct Graph {
    topology: Topology,
}

impl Graph {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Walk the graph from the entry node until a transition reaches the end.
    pub async fn execute(&self, runner: &mut dyn NodeRunner, state: &mut RequestState) -> Result<()> {
        let start = Instant::now();
        let max_steps = self.topology.node_count() * 2;
        let mut current = self.topology.entry;

        loop {
            if state.workflow_path.len() >= max_steps {
                warn!(node_id = %current, steps = state.workflow_path.len(), "Step limit reached, aborting graph");
                return Err(MaestroError::Graph(format!(
                    "step limit of {} exceeded at '{}'",
                    max_steps, current
                )));
            }
            state.workflow_path.push(current);

            debug!(node_id = %current, "Executing graph node");
            let node_start = Instant::now();
            runner.run(current, state).await?;
            debug!(
                node_id = %current,
                failed = state.has_error(),
                elapsed_ms = node_start.elapsed().as_millis() as u64,
                "Node execution complete"
            );

            let transition = self
                .topology
                .transitions
                .get(&current)
                .ok_or_else(|| MaestroError::Graph(format!("node '{}' not found in graph", current)))?;

            let target = match transition {
                Transition::Always(target) => *target,
                Transition::Branch { router, branches } => {
                    let label = (router.route)(state);
                    debug!(node_id = %current, router = router.name, label = %label, "Edge selected");
                    *branches.get(&label).ok_or_else(|| {
                        MaestroError::Graph(format!(
                            "router '{}' returned undeclared label '{}'",
                            router.name, label
                        ))
                    })?
                }
            };

            match target {
                Target::Node(next) => current = next,
                Target::End => break,
            }
        }

        if state.error.is_some() == state.final_response.is_some() {
            return Err(MaestroError::Graph(format!(
                "run ended at '{}' without exactly one of error or final response",
                current
            )));
        }

        info!(
            steps = state.workflow_path.len(),
            failed = state.has_error(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Graph run complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::{EdgeLabel, GraphBuilder, Router};
    use crate::graph::state::ErrorKind;

    fn route(state: &RequestState) -> EdgeLabel {
        if state.has_error() {
            EdgeLabel::Error
        } else {
            EdgeLabel::Synthesize
        }
    }

    const ROUTER: Router = Router {
        name: "route",
        labels: &[EdgeLabel::Error, EdgeLabel::Synthesize],
        route,
    };

    fn graph() -> Graph {
        let topology = GraphBuilder::new(NodeId::ClassifyTask)
            .node(NodeId::ClassifyTask)
            .node(NodeId::SynthesizeResponse)
            .node(NodeId::HandleError)
            .conditional(
                NodeId::ClassifyTask,
                ROUTER,
                &[
                    (EdgeLabel::Error, Target::Node(NodeId::HandleError)),
                    (EdgeLabel::Synthesize, Target::Node(NodeId::SynthesizeResponse)),
                ],
            )
            .edge(NodeId::SynthesizeResponse, Target::End)
            .edge(NodeId::HandleError, Target::End)
            .build()
            .unwrap();
        Graph::new(topology)
    }

    struct Scripted {
        fail_classify: bool,
        skip_synthesis: bool,
    }

    impl NodeRunner for Scripted {
        fn run<'a>(&'a mut self, node: NodeId, state: &'a mut RequestState) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                match node {
                    NodeId::ClassifyTask if self.fail_classify => {
                        state.fail(node, ErrorKind::Validation, "empty")
                    }
                    NodeId::SynthesizeResponse if !self.skip_synthesis => {
                        state.final_response = Some("ok".into())
                    }
                    NodeId::HandleError => {
                        if let Some(error) = state.error.as_mut() {
                            error.user_message = Some("sorry".into());
                        }
                    }
                    _ => {}
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let mut state = RequestState::new("hi");
        let mut runner = Scripted {
            fail_classify: false,
            skip_synthesis: false,
        };
        graph().execute(&mut runner, &mut state).await.unwrap();
        assert_eq!(
            state.workflow_path,
            vec![NodeId::ClassifyTask, NodeId::SynthesizeResponse]
        );
        assert_eq!(state.reply(), Some("ok"));
    }

    #[tokio::test]
    async fn test_error_path_is_terminal() {
        let mut state = RequestState::new("");
        let mut runner = Scripted {
            fail_classify: true,
            skip_synthesis: false,
        };
        graph().execute(&mut runner, &mut state).await.unwrap();
        assert_eq!(state.workflow_path.last(), Some(&NodeId::HandleError));
        assert!(state.final_response.is_none());
        assert_eq!(state.reply(), Some("sorry"));
    }

    #[tokio::test]
    async fn test_missing_outcome_is_fatal() {
        let mut state = RequestState::new("hi");
        let mut runner = Scripted {
            fail_classify: false,
            skip_synthesis: true,
        };
        let err = graph().execute(&mut runner, &mut state).await.unwrap_err();
        assert!(matches!(err, MaestroError::Graph(_)));
    }

    #[tokio::test]
    async fn test_runner_fault_aborts() {
        struct Faulty;
        impl NodeRunner for Faulty {
            fn run<'a>(&'a mut self, _: NodeId, _: &'a mut RequestState) -> BoxFuture<'a, Result<()>> {
                Box::pin(async { Err(MaestroError::Graph("fault".into())) })
            }
        }
        let mut state = RequestState::new("hi");
        assert!(graph().execute(&mut Faulty, &mut state).await.is_err());
        assert_eq!(state.workflow_path, vec![NodeId::ClassifyTask]);
    }
}
