//! The server side of the agent protocol.
//!
//! [`WorkDispatcher`] answers agent requests: it authenticates agents
//! against the registry, hands out scheduled jobs from the board, applies
//! progress reports, and hands terminal jobs to the archive and the
//! lifecycle tracker.

use crate::board::{JobBoard, Transition};
use crate::config::DispatchConfig;
use crate::lifecycle::BuildLifecycleTracker;
use crate::matching::{JobMatcher, ResourceMatcher};
use crate::registry::{AgentRegistry, Authorization};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::Result;
use drover_core::agent::{Agent, AgentInfo};
use drover_core::events::{
    AgentLostContactPayload, AgentRegisteredPayload, Event, JobAssignedPayload,
    JobCancelledPayload, JobCompletedPayload, JobRescheduledPayload,
};
use drover_core::ids::{AgentId, Cookie, JobIdentifier};
use drover_core::job::{BuildAssignment, JobResult, JobState};
use drover_core::ports::{AgentStore, EventBus, JobArchive};
use drover_core::protocol::AgentProtocol;
use drover_core::work::{AgentInstruction, Work};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct WorkDispatcher {
    registry: Arc<AgentRegistry>,
    board: Arc<JobBoard>,
    tracker: Arc<BuildLifecycleTracker>,
    matcher: Arc<dyn JobMatcher>,
    archive: Arc<dyn JobArchive>,
    events: Arc<dyn EventBus>,
}

impl WorkDispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        board: Arc<JobBoard>,
        tracker: Arc<BuildLifecycleTracker>,
        archive: Arc<dyn JobArchive>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            registry,
            board,
            tracker,
            matcher: Arc::new(ResourceMatcher::new()),
            archive,
            events,
        }
    }

    /// Wire up a dispatcher and its collaborators around the given ports.
    pub fn build(
        config: DispatchConfig,
        store: Arc<dyn AgentStore>,
        archive: Arc<dyn JobArchive>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        let board = Arc::new(JobBoard::new());
        let tracker = Arc::new(BuildLifecycleTracker::new(board.clone(), events.clone()));
        let registry = Arc::new(AgentRegistry::new(store, config));
        Self::new(registry, board, tracker, archive, events)
    }

    /// Replace the capability predicate used by `get_work`.
    pub fn with_matcher(mut self, matcher: Arc<dyn JobMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn board(&self) -> &Arc<JobBoard> {
        &self.board
    }

    pub fn tracker(&self) -> &Arc<BuildLifecycleTracker> {
        &self.tracker
    }

    /// Offer the oldest matching scheduled job to an agent.
    async fn assign_next(&self, agent: &Agent) -> Result<Work> {
        for candidate in self.board.scheduled() {
            if !self.matcher.matches(agent, &candidate.requirements) {
                continue;
            }
            // Another agent may win the race; move on to the next candidate.
            let Some(assigned) = self.board.try_assign(&candidate.job, agent.id) else {
                continue;
            };

            self.registry.mark_building(agent.id, &assigned.job);
            info!(agent_id = %agent.id, job = %assigned.job, "Job assigned");
            self.events
                .publish(Event::JobAssigned(JobAssignedPayload {
                    job: assigned.job.clone(),
                    agent_id: agent.id,
                    assigned_at: Utc::now(),
                }))
                .await?;
            return Ok(Work::build(assigned));
        }
        Ok(Work::NoWork)
    }

    async fn requeue(&self, assignment: &BuildAssignment, agent: AgentId, reason: &str) -> Result<()> {
        if !self.board.requeue(&assignment.job, agent) {
            return Ok(());
        }
        warn!(agent_id = %agent, job = %assignment.job, reason, "Job rescheduled");
        self.events
            .publish(Event::JobRescheduled(JobRescheduledPayload {
                job: assignment.job.clone(),
                previous_agent: Some(agent),
                reason: reason.to_string(),
            }))
            .await
    }

    /// Archive a terminal job, announce it and let the tracker move on.
    async fn finished(&self, done: BuildAssignment) -> Result<()> {
        self.archive.archive(&done).await?;

        let event = match done.state {
            JobState::Cancelled => Event::JobCancelled(JobCancelledPayload {
                job: done.job.clone(),
                agent_id: done.assigned_agent,
                cancelled_at: done.completed_at.unwrap_or_else(Utc::now),
            }),
            state => Event::JobCompleted(JobCompletedPayload {
                job: done.job.clone(),
                agent_id: done.assigned_agent,
                state,
                completed_at: done.completed_at.unwrap_or_else(Utc::now),
            }),
        };
        self.events.publish(event).await?;
        self.tracker.job_completed(&done).await
    }

    /// Cancel a job. A building agent is told to stop on its next ping or
    /// `is_ignored` call. Returns false if the job was already finished.
    pub async fn cancel_job(&self, job: &JobIdentifier) -> Result<bool> {
        let Some(done) = self.board.cancel(job) else {
            return Ok(false);
        };
        if let Some(agent) = done.assigned_agent {
            self.registry.mark_cancelled(agent);
        }
        info!(job = %job, "Job cancelled");
        self.finished(done).await?;
        Ok(true)
    }

    pub async fn approve_agent(&self, id: AgentId) -> Result<Agent> {
        self.registry.approve(id).await
    }

    pub async fn enable_agent(&self, id: AgentId) -> Result<Agent> {
        self.registry.enable(id).await
    }

    /// Disable an agent, cancelling the job it is running.
    pub async fn disable_agent(&self, id: AgentId) -> Result<Agent> {
        let agent = self.registry.disable(id).await?;
        if let Some(active) = self.board.active_for(id) {
            self.cancel_job(&active.job).await?;
        }
        Ok(self.registry.get(id).unwrap_or(agent))
    }

    pub async fn delete_agent(&self, id: AgentId) -> Result<Agent> {
        self.registry.delete(id).await
    }

    /// Mark agents that stopped pinging as lost and put their jobs back on
    /// the board. Returns the lost agents.
    pub async fn sweep_lost_agents(&self, now: DateTime<Utc>) -> Result<Vec<AgentId>> {
        let lost = self.registry.sweep(now);
        let mut ids = Vec::with_capacity(lost.len());

        for agent in lost {
            warn!(
                agent_id = %agent.id,
                hostname = %agent.hostname,
                last_heard_at = ?agent.last_heard_at,
                "Agent lost contact"
            );
            let active = self.board.active_for(agent.id);
            if let Some(active) = &active {
                self.requeue(active, agent.id, "agent lost contact").await?;
                self.registry.clear_job(agent.id);
            }
            self.events
                .publish(Event::AgentLostContact(AgentLostContactPayload {
                    agent_id: agent.id,
                    last_heard_at: agent.last_heard_at,
                    job: active.map(|a| a.job),
                }))
                .await?;
            ids.push(agent.id);
        }

        Ok(ids)
    }
}

#[async_trait]
impl AgentProtocol for WorkDispatcher {
    async fn ping(&self, info: &AgentInfo) -> Result<AgentInstruction> {
        let outcome = self.registry.ping(info).await?;
        if let Some(agent) = outcome.registered {
            self.events
                .publish(Event::AgentRegistered(AgentRegisteredPayload {
                    agent_id: agent.id,
                    hostname: agent.hostname.clone(),
                    resources: agent.resources.clone(),
                    registered_at: agent.registered_at,
                }))
                .await?;
        }
        if outcome.instruction != AgentInstruction::None {
            debug!(agent_id = %info.id, instruction = ?outcome.instruction, "Instructing agent");
        }
        Ok(outcome.instruction)
    }

    async fn get_cookie(&self, info: &AgentInfo) -> Result<Cookie> {
        self.registry.assign_cookie(info).await
    }

    async fn get_work(&self, info: &AgentInfo) -> Result<Work> {
        let agent = match self.registry.authorize(info) {
            Authorization::Registered(agent) => agent,
            Authorization::Unregistered => {
                debug!(agent_id = %info.id, "Work requested by unregistered agent");
                return Ok(Work::UnregisteredAgent { agent_id: info.id });
            }
            Authorization::Denied => {
                debug!(agent_id = %info.id, "Work requested by disabled agent");
                return Ok(Work::DeniedAgent { agent_id: info.id });
            }
        };

        if let Some(active) = self.board.active_for(agent.id) {
            // The previous response was lost; hand out the same job again.
            if active.state == JobState::Assigned {
                debug!(agent_id = %agent.id, job = %active.job, "Repeating assignment");
                return Ok(Work::build(active));
            }
            // The agent asks for work while we think it is running a job.
            self.requeue(&active, agent.id, "agent abandoned job").await?;
        }

        self.assign_next(&agent).await
    }

    async fn report_current_status(
        &self,
        info: &AgentInfo,
        job: &JobIdentifier,
        state: JobState,
    ) -> Result<()> {
        if !self.registry.is_current(info) {
            debug!(agent_id = %info.id, job = %job, "Ignoring report from unregistered agent");
            return Ok(());
        }
        match self.board.advance(job, info.id, state) {
            Transition::Advanced { from, to } => {
                debug!(agent_id = %info.id, job = %job, %from, %to, "Job advanced");
            }
            other => {
                debug!(agent_id = %info.id, job = %job, %state, outcome = ?other, "Ignoring status report");
            }
        }
        Ok(())
    }

    async fn report_completing(
        &self,
        info: &AgentInfo,
        job: &JobIdentifier,
        result: JobResult,
    ) -> Result<()> {
        if !self.registry.is_current(info) {
            return Ok(());
        }
        if !self.board.record_result(job, info.id, result) {
            debug!(agent_id = %info.id, job = %job, "Ignoring completing report");
        }
        Ok(())
    }

    async fn report_completed(
        &self,
        info: &AgentInfo,
        job: &JobIdentifier,
        result: JobResult,
    ) -> Result<()> {
        if !self.registry.is_current(info) {
            return Ok(());
        }
        let Some(done) = self.board.finalize(job, info.id, result) else {
            debug!(agent_id = %info.id, job = %job, "Ignoring duplicate completion");
            return Ok(());
        };

        info!(agent_id = %info.id, job = %job, state = %done.state, "Job completed");
        self.registry.release(info.id);
        self.finished(done).await
    }

    async fn is_ignored(&self, info: &AgentInfo, job: &JobIdentifier) -> Result<bool> {
        Ok(self.board.is_ignored(job, info.id))
    }
}
