//! Responses handed to agents.

use crate::ids::AgentId;
use crate::job::BuildAssignment;
use serde::{Deserialize, Serialize};

/// What an agent should do next, returned by `get_work`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Work {
    NoWork,
    Build { assignment: Box<BuildAssignment> },
    /// The agent is known but disabled.
    DeniedAgent { agent_id: AgentId },
    /// The agent's id and cookie do not match an active registration.
    UnregisteredAgent { agent_id: AgentId },
}

impl Work {
    pub fn build(assignment: BuildAssignment) -> Self {
        Work::Build {
            assignment: Box::new(assignment),
        }
    }

    pub fn assignment(&self) -> Option<&BuildAssignment> {
        match self {
            Work::Build { assignment } => Some(assignment),
            _ => None,
        }
    }

    pub fn is_build(&self) -> bool {
        matches!(self, Work::Build { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Work::NoWork => "no_work",
            Work::Build { .. } => "build",
            Work::DeniedAgent { .. } => "denied_agent",
            Work::UnregisteredAgent { .. } => "unregistered_agent",
        }
    }
}

/// Directive returned on `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentInstruction {
    None,
    CancelJob,
    KillRunningTasks,
}
