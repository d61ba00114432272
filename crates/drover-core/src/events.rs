//! Lifecycle events published by the scheduler.

use crate::ids::{AgentId, JobIdentifier, PipelineName};
use crate::job::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Agent
    AgentRegistered(AgentRegisteredPayload),
    AgentLostContact(AgentLostContactPayload),

    // Job lifecycle
    JobScheduled(JobScheduledPayload),
    JobAssigned(JobAssignedPayload),
    JobRescheduled(JobRescheduledPayload),
    JobCompleted(JobCompletedPayload),
    JobCancelled(JobCancelledPayload),

    // Pipeline
    PipelineCompleted(PipelineCompletedPayload),
}

impl Event {
    /// Dot-separated subject used for subscription filtering.
    pub fn subject(&self) -> String {
        match self {
            Event::AgentRegistered(p) => format!("agent.{}.registered", p.agent_id),
            Event::AgentLostContact(p) => format!("agent.{}.lost_contact", p.agent_id),
            Event::JobScheduled(p) => format!("job.{}.scheduled", p.job.pipeline_name.key()),
            Event::JobAssigned(p) => format!("job.{}.assigned", p.job.pipeline_name.key()),
            Event::JobRescheduled(p) => format!("job.{}.rescheduled", p.job.pipeline_name.key()),
            Event::JobCompleted(p) => format!("job.{}.completed", p.job.pipeline_name.key()),
            Event::JobCancelled(p) => format!("job.{}.cancelled", p.job.pipeline_name.key()),
            Event::PipelineCompleted(p) => format!("pipeline.{}.completed", p.pipeline.key()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisteredPayload {
    pub agent_id: AgentId,
    pub hostname: String,
    pub resources: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLostContactPayload {
    pub agent_id: AgentId,
    pub last_heard_at: Option<DateTime<Utc>>,
    pub job: Option<JobIdentifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobScheduledPayload {
    pub job: JobIdentifier,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAssignedPayload {
    pub job: JobIdentifier,
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRescheduledPayload {
    pub job: JobIdentifier,
    pub previous_agent: Option<AgentId>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletedPayload {
    pub job: JobIdentifier,
    pub agent_id: Option<AgentId>,
    pub state: JobState,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancelledPayload {
    pub job: JobIdentifier,
    pub agent_id: Option<AgentId>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCompletedPayload {
    pub pipeline: PipelineName,
    pub counter: u32,
    pub passed: bool,
    pub completed_at: DateTime<Utc>,
}

/// Match a subject against a pattern where `*` matches one token and `>`
/// matches the remainder.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("job.*.completed", "job.build.completed"));
        assert!(subject_matches("job.>", "job.build.assigned"));
        assert!(subject_matches("job.build.assigned", "job.build.assigned"));
        assert!(!subject_matches("job.*", "job.build.assigned"));
        assert!(!subject_matches("agent.>", "job.build.assigned"));
        assert!(!subject_matches("job.>", "job"));
    }

    #[test]
    fn test_subject_uses_lowercase_pipeline() {
        let event = Event::PipelineCompleted(PipelineCompletedPayload {
            pipeline: PipelineName::new("Up42"),
            counter: 1,
            passed: true,
            completed_at: Utc::now(),
        });
        assert_eq!(event.subject(), "pipeline.up42.completed");
    }
}
