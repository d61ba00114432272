//! The job board: every non-archived job and its per-job state machine.
//!
//! Each job sits behind its own mutex, so transitions on one job are atomic
//! and never contend with transitions on another.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use drover_core::AgentId;
use drover_core::ids::JobIdentifier;
use drover_core::job::{BuildAssignment, JobResult, JobState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type Slot = Arc<Mutex<BuildAssignment>>;

/// Outcome of a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: JobState, to: JobState },
    /// The report is not newer than the current state.
    Stale,
    /// The job is held by another agent or by nobody.
    NotHolder,
    Unknown,
}

#[derive(Default)]
pub struct JobBoard {
    jobs: DashMap<JobIdentifier, Slot>,
    sequence: AtomicU64,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job in `Scheduled` state. Returns false if the job is already
    /// on the board.
    pub fn schedule(&self, mut assignment: BuildAssignment) -> bool {
        match self.jobs.entry(assignment.job.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                assignment.state = JobState::Scheduled;
                assignment.assigned_agent = None;
                assignment.result = None;
                assignment.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                entry.insert(Arc::new(Mutex::new(assignment)));
                true
            }
        }
    }

    fn slot(&self, job: &JobIdentifier) -> Option<Slot> {
        self.jobs.get(job).map(|entry| entry.value().clone())
    }

    pub fn get(&self, job: &JobIdentifier) -> Option<BuildAssignment> {
        self.slot(job).map(|slot| slot.lock().clone())
    }

    /// Scheduled jobs, oldest first.
    pub fn scheduled(&self) -> Vec<BuildAssignment> {
        let mut jobs: Vec<_> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let job = slot.lock();
                (job.state == JobState::Scheduled).then(|| job.clone())
            })
            .collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    /// Move a job from `Scheduled` to `Assigned`. Only one caller can win.
    pub fn try_assign(&self, job: &JobIdentifier, agent: AgentId) -> Option<BuildAssignment> {
        let slot = self.slot(job)?;
        let mut job = slot.lock();
        if job.state != JobState::Scheduled {
            return None;
        }
        job.state = JobState::Assigned;
        job.assigned_agent = Some(agent);
        Some(job.clone())
    }

    /// Apply a progress report from the holding agent. Only forward,
    /// non-terminal moves are accepted.
    pub fn advance(&self, job: &JobIdentifier, agent: AgentId, state: JobState) -> Transition {
        let Some(slot) = self.slot(job) else {
            return Transition::Unknown;
        };
        let mut job = slot.lock();
        if !job.is_held_by(agent) {
            return Transition::NotHolder;
        }
        if state.is_terminal() || job.state.is_terminal() || state.rank() <= job.state.rank() {
            return Transition::Stale;
        }
        let from = job.state;
        job.state = state;
        Transition::Advanced { from, to: state }
    }

    /// Record the agent's result and move the job to `Completing`. The first
    /// recorded result is kept.
    pub fn record_result(&self, job: &JobIdentifier, agent: AgentId, result: JobResult) -> bool {
        let Some(slot) = self.slot(job) else {
            return false;
        };
        let mut job = slot.lock();
        if !job.is_held_by(agent) || job.state.is_terminal() {
            return false;
        }
        if job.result.is_none() {
            job.result = Some(result);
        }
        if job.state.rank() < JobState::Completing.rank() {
            job.state = JobState::Completing;
        }
        true
    }

    /// Finish a job held by `agent`. Returns the final assignment to
    /// exactly one caller and removes it from the board.
    pub fn finalize(
        &self,
        job: &JobIdentifier,
        agent: AgentId,
        result: JobResult,
    ) -> Option<BuildAssignment> {
        self.finish(job, Some(agent), result)
    }

    /// Cancel a job whatever its holder. Returns the cancelled assignment,
    /// or `None` if it was already finished.
    pub fn cancel(&self, job: &JobIdentifier) -> Option<BuildAssignment> {
        self.finish(job, None, JobResult::Cancelled)
    }

    fn finish(
        &self,
        job_id: &JobIdentifier,
        agent: Option<AgentId>,
        result: JobResult,
    ) -> Option<BuildAssignment> {
        let slot = self.slot(job_id)?;
        let mut job = slot.lock();
        if job.state.is_terminal() {
            return None;
        }
        if let Some(agent) = agent
            && !job.is_held_by(agent)
        {
            return None;
        }

        let result = match agent {
            Some(_) => job.result.unwrap_or(result),
            None => result,
        };
        job.result = Some(result);
        job.state = result.final_state();
        job.completed_at = Some(Utc::now());
        let finished = job.clone();

        self.jobs
            .remove_if(job_id, |_, current| Arc::ptr_eq(current, &slot));
        Some(finished)
    }

    /// Put a job held by `agent` back to `Scheduled`, keeping its place in
    /// the queue.
    pub fn requeue(&self, job: &JobIdentifier, agent: AgentId) -> bool {
        let Some(slot) = self.slot(job) else {
            return false;
        };
        let mut job = slot.lock();
        if !job.is_held_by(agent) || !job.state.is_active() {
            return false;
        }
        job.state = JobState::Scheduled;
        job.assigned_agent = None;
        job.result = None;
        true
    }

    /// The unfinished job an agent holds, if any.
    pub fn active_for(&self, agent: AgentId) -> Option<BuildAssignment> {
        self.slots().into_iter().find_map(|slot| {
            let job = slot.lock();
            (job.is_held_by(agent) && job.state.is_active()).then(|| job.clone())
        })
    }

    /// Whether `agent` should stop working on `job`: the job is finished,
    /// unknown, or no longer held by that agent.
    pub fn is_ignored(&self, job: &JobIdentifier, agent: AgentId) -> bool {
        match self.slot(job) {
            Some(slot) => {
                let job = slot.lock();
                job.state.is_terminal() || !job.is_held_by(agent)
            }
            None => true,
        }
    }

    pub fn snapshot(&self) -> Vec<BuildAssignment> {
        let mut jobs: Vec<_> = self.slots().into_iter().map(|s| s.lock().clone()).collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    // Clone the slots out so no shard lock is held while a job lock is taken.
    fn slots(&self) -> Vec<Slot> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::job::{JobOutcome, JobRequirements};
    use drover_core::pipeline::BuildCause;
    use std::collections::HashSet;

    fn job(name: &str) -> JobIdentifier {
        JobIdentifier::new("pipe", 1, "stage", 1, name)
    }

    fn assignment(name: &str) -> BuildAssignment {
        BuildAssignment::new(
            job(name),
            JobRequirements::default(),
            BuildCause::default(),
            vec!["true".to_string()],
        )
    }

    #[test]
    fn test_schedule_is_idempotent() {
        let board = JobBoard::new();
        assert!(board.schedule(assignment("a")));
        assert!(!board.schedule(assignment("a")));
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn test_scheduled_is_oldest_first() {
        let board = JobBoard::new();
        for name in ["c", "a", "b"] {
            board.schedule(assignment(name));
        }
        let names: Vec<_> = board
            .scheduled()
            .into_iter()
            .map(|a| a.job.job_name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_only_one_agent_wins_assignment() {
        let board = Arc::new(JobBoard::new());
        board.schedule(assignment("a"));

        let winners: Vec<AgentId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let board = board.clone();
                    scope.spawn(move || {
                        let agent = AgentId::new();
                        board.try_assign(&job("a"), agent).map(|_| agent)
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(winners.len(), 1);
        assert_eq!(board.get(&job("a")).unwrap().assigned_agent, Some(winners[0]));
    }

    #[test]
    fn test_advance_only_moves_forward_for_holder() {
        let board = JobBoard::new();
        let agent = AgentId::new();
        board.schedule(assignment("a"));
        board.try_assign(&job("a"), agent).unwrap();

        assert_eq!(
            board.advance(&job("a"), AgentId::new(), JobState::Building),
            Transition::NotHolder
        );
        assert_eq!(
            board.advance(&job("a"), agent, JobState::Building),
            Transition::Advanced {
                from: JobState::Assigned,
                to: JobState::Building
            }
        );
        assert_eq!(
            board.advance(&job("a"), agent, JobState::Preparing),
            Transition::Stale
        );
        assert_eq!(
            board.advance(&job("b"), agent, JobState::Building),
            Transition::Unknown
        );
    }

    #[test]
    fn test_finalize_exactly_once() {
        let board = JobBoard::new();
        let agent = AgentId::new();
        board.schedule(assignment("a"));
        board.try_assign(&job("a"), agent).unwrap();

        let done = board.finalize(&job("a"), agent, JobResult::Passed).unwrap();
        assert_eq!(done.state, JobState::Completed(JobOutcome::Passed));
        assert!(board.finalize(&job("a"), agent, JobResult::Failed).is_none());
        assert!(board.is_ignored(&job("a"), agent));
        assert!(board.is_empty());
    }

    #[test]
    fn test_first_recorded_result_wins() {
        let board = JobBoard::new();
        let agent = AgentId::new();
        board.schedule(assignment("a"));
        board.try_assign(&job("a"), agent).unwrap();

        assert!(board.record_result(&job("a"), agent, JobResult::Failed));
        assert!(board.record_result(&job("a"), agent, JobResult::Passed));
        assert_eq!(board.get(&job("a")).unwrap().state, JobState::Completing);

        let done = board.finalize(&job("a"), agent, JobResult::Passed).unwrap();
        assert_eq!(done.state, JobState::Completed(JobOutcome::Failed));
    }

    #[test]
    fn test_requeue_releases_holder() {
        let board = JobBoard::new();
        let agent = AgentId::new();
        board.schedule(assignment("a"));
        board.schedule(assignment("b"));
        board.try_assign(&job("a"), agent).unwrap();
        board.advance(&job("a"), agent, JobState::Building);

        assert_eq!(board.active_for(agent).unwrap().job, job("a"));
        assert!(board.requeue(&job("a"), agent));
        assert!(board.active_for(agent).is_none());
        assert!(board.is_ignored(&job("a"), agent));

        let first = board.scheduled().into_iter().next().unwrap();
        assert_eq!(first.job, job("a"));
    }

    #[test]
    fn test_concurrent_finalize_and_cancel() {
        let board = Arc::new(JobBoard::new());
        let agent = AgentId::new();
        for i in 0..50 {
            let name = format!("job-{}", i);
            board.schedule(assignment(&name));
            board.try_assign(&job(&name), agent).unwrap();
        }

        let finished: Vec<JobIdentifier> = std::thread::scope(|scope| {
            let a = scope.spawn(|| {
                (0..50)
                    .filter_map(|i| board.finalize(&job(&format!("job-{}", i)), agent, JobResult::Passed))
                    .map(|a| a.job)
                    .collect::<Vec<_>>()
            });
            let b = scope.spawn(|| {
                (0..50)
                    .filter_map(|i| board.cancel(&job(&format!("job-{}", i))))
                    .map(|a| a.job)
                    .collect::<Vec<_>>()
            });
            let mut all = a.join().unwrap();
            all.extend(b.join().unwrap());
            all
        });

        let unique: HashSet<_> = finished.iter().cloned().collect();
        assert_eq!(finished.len(), 50);
        assert_eq!(unique.len(), 50);
        assert!(board.is_empty());
    }
}
