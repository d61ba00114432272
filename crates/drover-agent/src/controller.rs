//! Agent-side controller: cookie handling, the ping loop and the work loop.

use crate::config::AgentConfig;
use crate::executor::{JobExecutor, TaskOutcome};
use crate::identity;
use drover_core::Result;
use drover_core::agent::{AgentInfo, AgentRuntimeStatus};
use drover_core::ids::{AgentId, Cookie, JobIdentifier};
use drover_core::job::{BuildAssignment, JobResult, JobState};
use drover_core::protocol::AgentProtocol;
use drover_core::work::{AgentInstruction, Work};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Drives one agent process against an [`AgentProtocol`] server.
pub struct AgentController {
    config: AgentConfig,
    agent_id: AgentId,
    protocol: Arc<dyn AgentProtocol>,
    executor: JobExecutor,
    cookie: Mutex<Option<Cookie>>,
    // Serializes cookie acquisition between the ping and work loops.
    cookie_gate: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<AgentRuntimeStatus>,
    current_job_tx: watch::Sender<Option<JobIdentifier>>,
    cancel_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentController {
    /// Create a controller, loading or creating the persistent identity.
    pub fn new(config: AgentConfig, protocol: Arc<dyn AgentProtocol>) -> Result<Self> {
        let agent_id = identity::load_or_create(&config.identity_dir)?;
        Ok(Self::with_id(agent_id, config, protocol))
    }

    pub fn with_id(agent_id: AgentId, config: AgentConfig, protocol: Arc<dyn AgentProtocol>) -> Self {
        let executor = JobExecutor::new(config.workspace_dir.clone());
        let (status_tx, _) = watch::channel(AgentRuntimeStatus::Idle);
        let (current_job_tx, _) = watch::channel(None);
        let (cancel_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            agent_id,
            protocol,
            executor,
            cookie: Mutex::new(None),
            cookie_gate: tokio::sync::Mutex::new(()),
            status_tx,
            current_job_tx,
            cancel_tx,
            shutdown_tx,
        }
    }

    pub fn id(&self) -> AgentId {
        self.agent_id
    }

    pub fn status(&self) -> AgentRuntimeStatus {
        *self.status_tx.borrow()
    }

    pub fn current_job(&self) -> Option<JobIdentifier> {
        self.current_job_tx.borrow().clone()
    }

    pub fn cookie(&self) -> Option<Cookie> {
        self.cookie.lock().clone()
    }

    /// Snapshot of what the agent tells the server about itself.
    pub fn info(&self) -> AgentInfo {
        let mut info = AgentInfo::new(self.agent_id, self.config.hostname.clone())
            .with_resources(self.config.resources.iter().cloned())
            .with_environments(self.config.environments.iter().cloned())
            .with_status(self.status());
        info.cookie = self.cookie();
        info
    }

    /// Obtain a cookie if this process does not hold one yet.
    pub async fn ensure_cookie(&self) -> Result<Cookie> {
        let _gate = self.cookie_gate.lock().await;
        if let Some(cookie) = self.cookie() {
            return Ok(cookie);
        }

        let cookie = self.protocol.get_cookie(&self.info()).await?;
        *self.cookie.lock() = Some(cookie.clone());
        info!(agent_id = %self.agent_id, "Obtained agent cookie");
        Ok(cookie)
    }

    /// Ping once and act on the returned instruction.
    pub async fn ping(&self) -> Result<AgentInstruction> {
        let instruction = self.protocol.ping(&self.info()).await?;

        match instruction {
            AgentInstruction::None => {}
            AgentInstruction::CancelJob => {
                if self.current_job().is_some() && !*self.cancel_tx.borrow() {
                    info!(agent_id = %self.agent_id, job = ?self.current_job(), "Server cancelled job");
                    self.status_tx.send_replace(AgentRuntimeStatus::Cancelled);
                    self.cancel_tx.send_replace(true);
                }
            }
            AgentInstruction::KillRunningTasks => {
                if self.current_job().is_some() {
                    warn!(
                        agent_id = %self.agent_id,
                        job = ?self.current_job(),
                        "Server requested to kill running tasks"
                    );
                    self.status_tx.send_replace(AgentRuntimeStatus::Cancelled);
                    self.cancel_tx.send_replace(true);
                }
            }
        }

        Ok(instruction)
    }

    /// Ask for work once and run it if it is a build.
    pub async fn poll_work(&self) -> Result<Work> {
        self.ensure_cookie().await?;
        let work = self.protocol.get_work(&self.info()).await?;

        match &work {
            Work::Build { assignment } => {
                self.run_job(assignment).await?;
            }
            Work::UnregisteredAgent { .. } => {
                warn!(agent_id = %self.agent_id, "Server does not recognise this agent, re-registering");
                self.cookie.lock().take();
            }
            Work::DeniedAgent { .. } => {
                debug!(agent_id = %self.agent_id, "Agent is disabled");
            }
            Work::NoWork => {
                debug!(agent_id = %self.agent_id, "No work available");
            }
        }

        Ok(work)
    }

    /// Run an assigned job, reporting every state change to the server.
    pub async fn run_job(&self, assignment: &BuildAssignment) -> Result<JobResult> {
        let job = &assignment.job;
        info!(agent_id = %self.agent_id, job = %job, tasks = assignment.tasks.len(), "Starting job");

        self.cancel_tx.send_replace(false);
        self.current_job_tx.send_replace(Some(job.clone()));
        self.status_tx.send_replace(AgentRuntimeStatus::Building);

        let result = self.execute(assignment).await;

        self.current_job_tx.send_replace(None);
        self.status_tx.send_replace(AgentRuntimeStatus::Idle);
        self.cancel_tx.send_replace(false);

        match &result {
            Ok(JobResult::Passed) => info!(job = %job, "Job passed"),
            Ok(other) => warn!(job = %job, result = ?other, "Job did not pass"),
            Err(e) => error!(job = %job, error = %e, "Job execution error"),
        }
        result
    }

    async fn execute(&self, assignment: &BuildAssignment) -> Result<JobResult> {
        let job = &assignment.job;
        self.protocol
            .report_current_status(&self.info(), job, JobState::Preparing)
            .await?;
        let workspace = self.executor.setup_workspace(job).await?;
        self.protocol
            .report_current_status(&self.info(), job, JobState::Building)
            .await?;

        let mut cancel = self.cancel_tx.subscribe();
        let mut result = JobResult::Passed;

        for (index, task) in assignment.tasks.iter().enumerate() {
            if *cancel.borrow() || self.protocol.is_ignored(&self.info(), job).await? {
                info!(job = %job, index, "Job abandoned by server, aborting");
                result = JobResult::Cancelled;
                break;
            }

            debug!(job = %job, index, "Running task");
            match self.executor.run_task(task, &workspace, &mut cancel).await? {
                TaskOutcome::Passed => {}
                TaskOutcome::Failed { .. } => {
                    result = JobResult::Failed;
                    break;
                }
                TaskOutcome::Cancelled => {
                    result = JobResult::Cancelled;
                    break;
                }
            }
        }

        self.protocol
            .report_completing(&self.info(), job, result)
            .await?;
        self.executor.cleanup_workspace(&workspace).await;
        self.protocol
            .report_completed(&self.info(), job, result)
            .await?;

        Ok(result)
    }

    /// Ping loop until shutdown.
    pub async fn run_ping_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.ping_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            agent_id = %self.agent_id,
            interval_secs = self.config.ping_interval_secs,
            "Starting ping loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.ping().await {
                        Ok(_) => debug!(agent_id = %self.agent_id, "Ping sent"),
                        Err(e) => error!(error = %e, "Failed to ping server"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Ping loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Work loop until shutdown. A running job is finished before the loop
    /// observes shutdown.
    pub async fn run_work_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!(agent_id = %self.agent_id, server = %self.config.server_url, "Starting work loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let back_off = match self.poll_work().await {
                Ok(work) => !work.is_build(),
                Err(e) => {
                    error!(error = %e, "Work poll failed");
                    true
                }
            };
            if !back_off {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.work_poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Work loop shutting down");
    }

    /// Spawn both loops. The handle completes once both have stopped.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pinger = Arc::clone(self);
        let worker = Arc::clone(self);
        let ping_shutdown = self.shutdown_tx.subscribe();
        let work_shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tokio::join!(
                pinger.run_ping_loop(ping_shutdown),
                worker.run_work_loop(work_shutdown)
            );
        })
    }

    /// Signal both loops to stop.
    pub fn shutdown(&self) {
        info!(agent_id = %self.agent_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);
    }
}
