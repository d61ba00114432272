//! Job assignment types and the per-job state machine.

use crate::ids::{AgentId, JobIdentifier};
use crate::pipeline::BuildCause;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "outcome")]
pub enum JobState {
    Scheduled,
    Assigned,
    Preparing,
    Building,
    Completing,
    Completed(JobOutcome),
    Cancelled,
}

impl JobState {
    /// Position in the forward progression. Reports may only move a job to a
    /// higher rank.
    pub fn rank(&self) -> u8 {
        match self {
            JobState::Scheduled => 0,
            JobState::Assigned => 1,
            JobState::Preparing => 2,
            JobState::Building => 3,
            JobState::Completing => 4,
            JobState::Completed(_) | JobState::Cancelled => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed(_) | JobState::Cancelled)
    }

    /// Held by an agent and not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Assigned | JobState::Preparing | JobState::Building | JobState::Completing
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Assigned => write!(f, "assigned"),
            JobState::Preparing => write!(f, "preparing"),
            JobState::Building => write!(f, "building"),
            JobState::Completing => write!(f, "completing"),
            JobState::Completed(JobOutcome::Passed) => write!(f, "passed"),
            JobState::Completed(JobOutcome::Failed) => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Passed,
    Failed,
}

/// Result an agent reports for a job it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Passed,
    Failed,
    Cancelled,
}

impl JobResult {
    /// Terminal state a job lands in for this result.
    pub fn final_state(self) -> JobState {
        match self {
            JobResult::Passed => JobState::Completed(JobOutcome::Passed),
            JobResult::Failed => JobState::Completed(JobOutcome::Failed),
            JobResult::Cancelled => JobState::Cancelled,
        }
    }
}

/// What an agent must offer to run a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirements {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
    /// Pins the job to a single agent.
    #[serde(default)]
    pub run_on_agent: Option<AgentId>,
}

/// One job run, from scheduling until it is archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAssignment {
    pub job: JobIdentifier,
    pub state: JobState,
    pub assigned_agent: Option<AgentId>,
    pub requirements: JobRequirements,
    pub build_cause: BuildCause,
    /// Shell commands executed in order on the agent.
    pub tasks: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// First result reported by the agent, kept until the job is finalized.
    pub result: Option<JobResult>,
    /// Scheduling order, used for oldest-first dispatch.
    pub sequence: u64,
}

impl BuildAssignment {
    pub fn new(
        job: JobIdentifier,
        requirements: JobRequirements,
        build_cause: BuildCause,
        tasks: Vec<String>,
    ) -> Self {
        Self {
            job,
            state: JobState::Scheduled,
            assigned_agent: None,
            requirements,
            build_cause,
            tasks,
            scheduled_at: Utc::now(),
            completed_at: None,
            result: None,
            sequence: 0,
        }
    }

    pub fn is_held_by(&self, agent: AgentId) -> bool {
        self.assigned_agent == Some(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_is_monotonic() {
        let progression = [
            JobState::Scheduled,
            JobState::Assigned,
            JobState::Preparing,
            JobState::Building,
            JobState::Completing,
            JobState::Completed(JobOutcome::Passed),
        ];
        for pair in progression.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Completed(JobOutcome::Failed).is_terminal());
        assert!(!JobState::Completing.is_terminal());
        assert!(JobState::Completing.is_active());
        assert!(!JobState::Scheduled.is_active());
    }

    #[test]
    fn test_result_final_state() {
        assert_eq!(JobResult::Cancelled.final_state(), JobState::Cancelled);
        assert_eq!(
            JobResult::Failed.final_state(),
            JobState::Completed(JobOutcome::Failed)
        );
    }
}
