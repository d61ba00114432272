//! Pipeline run lifecycle: which jobs get scheduled and when.
//!
//! The tracker turns triggers and finished jobs into new `Scheduled` jobs on
//! the [`JobBoard`]. Per-job transitions belong to the dispatcher; the
//! tracker only learns about jobs once they are terminal.

use crate::board::JobBoard;
use crate::dag::PipelineGraph;
use crate::triggers::{TriggerEvent, TriggerMatcher};
use chrono::{DateTime, Utc};
use drover_core::events::{Event, JobScheduledPayload, PipelineCompletedPayload};
use drover_core::ids::{JobIdentifier, PipelineName};
use drover_core::job::{BuildAssignment, JobOutcome, JobState};
use drover_core::pipeline::{BuildCause, MaterialRevision, PipelineConfig, StageConfig};
use drover_core::ports::EventBus;
use drover_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Building,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Building,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub name: String,
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub name: String,
    pub counter: u32,
    pub jobs: Vec<JobRun>,
}

impl StageRun {
    /// A stage finishes once every job is terminal; it passes only if every
    /// job passed.
    pub fn result(&self) -> StageResult {
        if !self.jobs.iter().all(|j| j.state.is_terminal()) {
            return StageResult::Building;
        }
        if self
            .jobs
            .iter()
            .all(|j| j.state == JobState::Completed(JobOutcome::Passed))
        {
            StageResult::Passed
        } else {
            StageResult::Failed
        }
    }
}

/// One instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline: PipelineName,
    pub counter: u32,
    pub label: String,
    pub build_cause: BuildCause,
    pub stages: Vec<StageRun>,
    pub status: RunStatus,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn stage(&self, name: &str) -> Option<&StageRun> {
        self.stages.iter().rev().find(|s| s.name == name)
    }

    /// Revision describing this run for its downstream pipelines.
    fn as_revision(&self) -> Option<MaterialRevision> {
        let last = self.stages.last()?;
        Some(MaterialRevision::upstream(
            &self.pipeline,
            self.counter,
            &last.name,
            last.counter,
        ))
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    counter: u32,
    active: Option<u32>,
    /// Latest trigger that arrived while a run was active.
    pending: Option<BuildCause>,
    runs: VecDeque<PipelineRun>,
}

impl PipelineState {
    fn latest(&self) -> Option<&PipelineRun> {
        self.runs.back()
    }
}

/// Validated configuration swapped in as a whole.
#[derive(Debug, Default)]
struct ConfigSnapshot {
    graph: PipelineGraph,
    pipelines: HashMap<PipelineName, PipelineConfig>,
    order: Vec<PipelineName>,
}

pub struct BuildLifecycleTracker {
    config: RwLock<Arc<ConfigSnapshot>>,
    states: Mutex<HashMap<PipelineName, PipelineState>>,
    board: Arc<JobBoard>,
    events: Arc<dyn EventBus>,
    triggers: TriggerMatcher,
}

impl BuildLifecycleTracker {
    pub fn new(board: Arc<JobBoard>, events: Arc<dyn EventBus>) -> Self {
        Self {
            config: RwLock::new(Arc::new(ConfigSnapshot::default())),
            states: Mutex::new(HashMap::new()),
            board,
            events,
            triggers: TriggerMatcher::new(),
        }
    }

    /// Replace the pipeline configuration. The new graph is fully resolved
    /// before it is swapped in; on error the current configuration stays.
    pub fn update_config(&self, pipelines: Vec<PipelineConfig>) -> Result<()> {
        let graph = PipelineGraph::from_configs(&pipelines);
        let order = graph.build_order()?;

        for pipeline in &pipelines {
            if pipeline.stages.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "Pipeline \"{}\" has no stages.",
                    pipeline.name
                )));
            }
            if let Some(stage) = pipeline.stages.iter().find(|s| s.jobs.is_empty()) {
                return Err(Error::InvalidConfig(format!(
                    "Stage \"{}\" of pipeline \"{}\" has no jobs.",
                    stage.name, pipeline.name
                )));
            }
        }

        let pipelines = pipelines
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect::<HashMap<_, _>>();

        info!(pipelines = pipelines.len(), "Pipeline configuration updated");
        *self.config.write() = Arc::new(ConfigSnapshot {
            graph,
            pipelines,
            order,
        });
        Ok(())
    }

    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.config.read().clone()
    }

    /// All configured pipelines, dependencies first.
    pub fn build_order(&self) -> Vec<PipelineName> {
        self.snapshot().order.clone()
    }

    /// Start a run of `pipeline`, or remember the cause if one is active.
    /// Returns the new run's counter when a run was started.
    pub async fn schedule_pipeline(
        &self,
        pipeline: &PipelineName,
        cause: BuildCause,
    ) -> Result<Option<u32>> {
        let config = self.snapshot();
        if !config.pipelines.contains_key(pipeline) {
            return Err(Error::PipelineNotFound(pipeline.to_string()));
        }
        config.graph.resolve(pipeline)?;

        let mut events = Vec::new();
        let counter = {
            let mut states = self.states.lock();
            self.start_run(&config, &mut states, pipeline, cause, &mut events)
        };
        self.publish_all(events).await?;
        Ok(counter)
    }

    /// Schedule every pipeline an external trigger affects, in build order.
    /// Returns the pipelines that were started.
    pub async fn on_trigger(&self, event: &TriggerEvent) -> Result<Vec<PipelineName>> {
        let config = self.snapshot();
        let affected = self.triggers.affected(
            config.order.iter().filter_map(|name| config.pipelines.get(name)),
            event,
        );
        if affected.is_empty() {
            debug!(?event, "Trigger matched no pipelines");
            return Ok(vec![]);
        }

        let mut started = Vec::new();
        for pipeline in affected {
            if self
                .schedule_pipeline(&pipeline, event.build_cause())
                .await?
                .is_some()
            {
                started.push(pipeline);
            }
        }
        Ok(started)
    }

    /// Account for a terminal job: schedule the next stage, finish the run,
    /// and consider downstream pipelines.
    pub async fn job_completed(&self, assignment: &BuildAssignment) -> Result<()> {
        if !assignment.state.is_terminal() {
            return Ok(());
        }
        let config = self.snapshot();
        let mut events = Vec::new();
        {
            let mut states = self.states.lock();
            self.record_job(&config, &mut states, assignment, &mut events);
        }
        self.publish_all(events).await
    }

    fn start_run(
        &self,
        config: &ConfigSnapshot,
        states: &mut HashMap<PipelineName, PipelineState>,
        name: &PipelineName,
        cause: BuildCause,
        events: &mut Vec<Event>,
    ) -> Option<u32> {
        let pipeline = config.pipelines.get(name)?;
        let first = pipeline.stages.first()?;
        let state = states.entry(name.clone()).or_default();

        if let Some(active) = state.active {
            debug!(pipeline = %name, active, "Run in progress, deferring trigger");
            state.pending = Some(cause);
            return None;
        }

        state.counter += 1;
        let counter = state.counter;
        let mut run = PipelineRun {
            pipeline: pipeline.name.clone(),
            counter,
            label: counter.to_string(),
            build_cause: cause,
            stages: vec![],
            status: RunStatus::Building,
            scheduled_at: Utc::now(),
            completed_at: None,
        };
        self.schedule_stage(pipeline, &mut run, first, events);

        info!(pipeline = %pipeline.name, counter, "Pipeline scheduled");
        state.active = Some(counter);
        state.runs.push_back(run);
        while state.runs.len() > HISTORY_LIMIT {
            state.runs.pop_front();
        }
        Some(counter)
    }

    fn schedule_stage(
        &self,
        pipeline: &PipelineConfig,
        run: &mut PipelineRun,
        stage: &StageConfig,
        events: &mut Vec<Event>,
    ) {
        let stage_counter = 1;
        let mut jobs = Vec::with_capacity(stage.jobs.len());

        for job in &stage.jobs {
            let id = JobIdentifier::new(
                pipeline.name.clone(),
                run.counter,
                stage.name.clone(),
                stage_counter,
                job.name.clone(),
            );
            let assignment = BuildAssignment::new(
                id.clone(),
                job.requirements(pipeline.environment.as_deref()),
                run.build_cause.clone(),
                job.tasks.clone(),
            );
            if self.board.schedule(assignment) {
                debug!(job = %id, "Job scheduled");
                events.push(Event::JobScheduled(JobScheduledPayload {
                    job: id,
                    scheduled_at: Utc::now(),
                }));
            }
            jobs.push(JobRun {
                name: job.name.clone(),
                state: JobState::Scheduled,
            });
        }

        run.stages.push(StageRun {
            name: stage.name.clone(),
            counter: stage_counter,
            jobs,
        });
    }

    fn record_job(
        &self,
        config: &ConfigSnapshot,
        states: &mut HashMap<PipelineName, PipelineState>,
        assignment: &BuildAssignment,
        events: &mut Vec<Event>,
    ) {
        let job = &assignment.job;
        let Some(pipeline) = config.pipelines.get(&job.pipeline_name) else {
            warn!(job = %job, "Completed job belongs to an unknown pipeline");
            return;
        };
        let Some(state) = states.get_mut(&job.pipeline_name) else {
            return;
        };
        let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.counter == job.pipeline_counter && r.status == RunStatus::Building)
        else {
            debug!(job = %job, "No active run for completed job");
            return;
        };
        let Some(stage) = run
            .stages
            .iter_mut()
            .find(|s| s.name == job.stage_name && s.counter == job.stage_counter)
        else {
            return;
        };
        let Some(job_run) = stage.jobs.iter_mut().find(|j| j.name == job.job_name) else {
            return;
        };
        if job_run.state.is_terminal() {
            return;
        }
        job_run.state = assignment.state;

        let passed = match stage.result() {
            StageResult::Building => return,
            StageResult::Failed => false,
            StageResult::Passed => {
                let stage_name = stage.name.clone();
                if let Some(next) = pipeline.next_stage(&stage_name) {
                    self.schedule_stage(pipeline, run, next, events);
                    return;
                }
                true
            }
        };

        run.status = if passed {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        run.completed_at = Some(Utc::now());
        let counter = run.counter;
        state.active = None;
        let pending = state.pending.take();

        info!(pipeline = %pipeline.name, counter, passed, "Pipeline completed");
        events.push(Event::PipelineCompleted(PipelineCompletedPayload {
            pipeline: pipeline.name.clone(),
            counter,
            passed,
            completed_at: Utc::now(),
        }));

        if passed {
            self.trigger_downstream(config, states, &pipeline.name, events);
        }
        if let Some(cause) = pending {
            self.start_run(config, states, &pipeline.name, cause, events);
        }
    }

    /// Schedule downstream pipelines whose upstream pipelines have all
    /// passed their latest run.
    fn trigger_downstream(
        &self,
        config: &ConfigSnapshot,
        states: &mut HashMap<PipelineName, PipelineState>,
        upstream: &PipelineName,
        events: &mut Vec<Event>,
    ) {
        let downstream = match config.graph.downstream(upstream) {
            Ok(downstream) => downstream,
            Err(e) => {
                warn!(pipeline = %upstream, error = %e, "Cannot resolve downstream pipelines");
                return;
            }
        };

        for name in downstream {
            let mut parents = config.graph.upstream(&name);
            // The triggering pipeline leads the build cause.
            parents.sort_by_key(|p| p != upstream);

            let revisions: Option<Vec<MaterialRevision>> = parents
                .iter()
                .map(|parent| {
                    states
                        .get(parent)
                        .and_then(PipelineState::latest)
                        .filter(|run| run.status == RunStatus::Passed)
                        .and_then(PipelineRun::as_revision)
                })
                .collect();

            match revisions {
                Some(revisions) => {
                    debug!(pipeline = %name, trigger = %upstream, "Upstream pipelines passed");
                    self.start_run(
                        config,
                        states,
                        &name,
                        BuildCause::from_revisions(revisions),
                        events,
                    );
                }
                None => {
                    debug!(pipeline = %name, "Waiting for remaining upstream pipelines");
                }
            }
        }
    }

    async fn publish_all(&self, events: Vec<Event>) -> Result<()> {
        for event in events {
            self.events.publish(event).await?;
        }
        Ok(())
    }

    pub fn latest_run(&self, pipeline: &PipelineName) -> Option<PipelineRun> {
        self.states
            .lock()
            .get(pipeline)
            .and_then(|s| s.latest().cloned())
    }

    /// Runs of a pipeline, most recent first.
    pub fn history(&self, pipeline: &PipelineName) -> Vec<PipelineRun> {
        self.states
            .lock()
            .get(pipeline)
            .map(|s| s.runs.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the most recent instance of `stage` failed or was cancelled.
    pub fn is_latest_stage_unsuccessful(&self, pipeline: &PipelineName, stage: &str) -> bool {
        let states = self.states.lock();
        let Some(state) = states.get(pipeline) else {
            return false;
        };
        state
            .runs
            .iter()
            .rev()
            .find_map(|run| run.stage(stage))
            .is_some_and(|s| s.result() == StageResult::Failed)
    }

    pub fn is_active(&self, pipeline: &PipelineName) -> bool {
        self.states
            .lock()
            .get(pipeline)
            .is_some_and(|s| s.active.is_some())
    }
}
