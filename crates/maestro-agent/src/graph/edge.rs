use std::collections::{HashMap, HashSet};
use std::fmt;

use maestro_core::error::{MaestroError, Result};

use super::node::NodeId;
use super::state::RequestState;

/// Label returned by a conditional edge's router.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EdgeLabel {
    Error,
    Route,
    Workflow,
    Next,
    Annotate,
    Data,
    Synthesize,
}

impl EdgeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Route => "route",
            Self::Workflow => "workflow",
            Self::Next => "next",
            Self::Annotate => "annotate",
            Self::Data => "data",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an edge leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    End,
}

/// A pure routing function together with every label it may return.
#[derive(Clone, Copy)]
pub struct Router {
    pub name: &'static str,
    pub labels: &'static [EdgeLabel],
    pub route: fn(&RequestState) -> EdgeLabel,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .finish()
    }
}

/// Outgoing transition of a node.
#[derive(Debug, Clone)]
pub enum Transition {
    Always(Target),
    Branch {
        router: Router,
        branches: HashMap<EdgeLabel, Target>,
    },
}

/// A validated graph topology.
#[derive(Debug)]
pub struct Topology {
    pub(crate) entry: NodeId,
    pub(crate) transitions: HashMap<NodeId, Transition>,
}

impl Topology {
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    pub fn node_count(&self) -> usize {
        self.transitions.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.transitions.contains_key(&node)
    }
}

/// Builds a `Topology`, checking it before use.
pub struct GraphBuilder {
    entry: NodeId,
    nodes: Vec<NodeId>,
    transitions: Vec<(NodeId, Transition)>,
}

impl GraphBuilder {
    pub fn new(entry: NodeId) -> Self {
        Self {
            entry,
            nodes: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: NodeId, to: Target) -> Self {
        self.transitions.push((from, Transition::Always(to)));
        self
    }

    pub fn conditional(mut self, from: NodeId, router: Router, branches: &[(EdgeLabel, Target)]) -> Self {
        self.transitions.push((
            from,
            Transition::Branch {
                router,
                branches: branches.iter().copied().collect(),
            },
        ));
        self
    }

    /// Validate and freeze the topology.
    ///
    /// Fails when a node is registered twice, has no or several outgoing
    /// transitions, an edge touches an unregistered node, a branch table
    /// and its router disagree on the label set, or a terminal node leads
    /// anywhere but the end.
    pub fn build(self) -> Result<Topology> {
        let mut registered = HashSet::new();
        for node in &self.nodes {
            if !registered.insert(*node) {
                return Err(invalid(format!("node '{}' registered twice", node)));
            }
        }
        if !registered.contains(&self.entry) {
            return Err(invalid(format!("entry node '{}' is not registered", self.entry)));
        }

        let mut transitions = HashMap::new();
        for (from, transition) in self.transitions {
            if !registered.contains(&from) {
                return Err(invalid(format!("edge from unregistered node '{}'", from)));
            }
            check_transition(from, &transition, &registered)?;
            if transitions.insert(from, transition).is_some() {
                return Err(invalid(format!("node '{}' has more than one outgoing transition", from)));
            }
        }

        for node in &self.nodes {
            if !transitions.contains_key(node) {
                return Err(invalid(format!("node '{}' has no outgoing transition", node)));
            }
        }

        Ok(Topology {
            entry: self.entry,
            transitions,
        })
    }
}

fn invalid(message: String) -> MaestroError {
    MaestroError::Graph(format!("invalid graph: {}", message))
}

fn check_target(from: NodeId, target: Target, registered: &HashSet<NodeId>) -> Result<()> {
    match target {
        Target::Node(to) if !registered.contains(&to) => Err(invalid(format!(
            "edge '{}' -> '{}' targets an unregistered node",
            from, to
        ))),
        Target::Node(to) if from.is_terminal() => Err(invalid(format!(
            "terminal node '{}' must lead to the end, not '{}'",
            from, to
        ))),
        _ => Ok(()),
    }
}

fn check_transition(from: NodeId, transition: &Transition, registered: &HashSet<NodeId>) -> Result<()> {
    match transition {
        Transition::Always(target) => check_target(from, *target, registered),
        Transition::Branch { router, branches } => {
            if from.is_terminal() {
                return Err(invalid(format!("terminal node '{}' cannot branch", from)));
            }
            for label in branches.keys() {
                if !router.labels.contains(label) {
                    return Err(invalid(format!(
                        "branch '{}' of '{}' is not a label router '{}' can return",
                        label, from, router.name
                    )));
                }
            }
            for label in router.labels {
                let target = branches.get(label).ok_or_else(|| {
                    invalid(format!(
                        "router '{}' on '{}' can return '{}' but no branch handles it",
                        router.name, from, label
                    ))
                })?;
                check_target(from, *target, registered)?;
            }
            Ok(())
        }
    }
}
