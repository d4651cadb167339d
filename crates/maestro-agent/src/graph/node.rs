use std::fmt;

use serde::{Deserialize, Serialize};

/// A node of the orchestration graph.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    ClassifyTask,
    RouteToAgent,
    RunGrading,
    RunFormatting,
    RunNotes,
    ManageData,
    SynthesizeResponse,
    HandleError,
}

impl NodeId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClassifyTask => "classify_task",
            Self::RouteToAgent => "route_to_agent",
            Self::RunGrading => "run_grading",
            Self::RunFormatting => "run_formatting",
            Self::RunNotes => "run_notes",
            Self::ManageData => "manage_data",
            Self::SynthesizeResponse => "synthesize_response",
            Self::HandleError => "handle_error",
        }
    }

    /// Nodes after which a run ends.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SynthesizeResponse | Self::HandleError)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
