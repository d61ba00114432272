//! Test context: a dispatcher on in-memory adapters plus helpers to attach
//! agents to it.

use drover_agent::{AgentConfig, AgentController};
use drover_core::agent::AgentInfo;
use drover_core::ids::{AgentId, PipelineName};
use drover_core::memory::{BroadcastEventBus, InMemoryAgentStore, InMemoryJobArchive};
use drover_core::pipeline::{BuildCause, PipelineConfig};
use drover_core::protocol::AgentProtocol;
use drover_scheduler::{DispatchConfig, WorkDispatcher};
use std::sync::Arc;
use tempfile::TempDir;

/// Dispatcher, tracker and their in-memory ports.
pub struct TestContext {
    pub dispatcher: Arc<WorkDispatcher>,
    pub agents: Arc<InMemoryAgentStore>,
    pub archive: Arc<InMemoryJobArchive>,
    pub events: Arc<BroadcastEventBus>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        crate::init_test_logging();

        let agents = Arc::new(InMemoryAgentStore::new());
        let archive = Arc::new(InMemoryJobArchive::new());
        let events = Arc::new(BroadcastEventBus::new());
        let dispatcher = WorkDispatcher::build(config, agents.clone(), archive.clone(), events.clone());

        Self {
            dispatcher: Arc::new(dispatcher),
            agents,
            archive,
            events,
        }
    }

    /// Install a pipeline configuration.
    pub fn load(&self, pipelines: Vec<PipelineConfig>) {
        self.dispatcher
            .tracker()
            .update_config(pipelines)
            .expect("pipeline configuration is valid");
    }

    /// Start a run and return its counter.
    pub async fn trigger(&self, pipeline: &str) -> u32 {
        self.dispatcher
            .tracker()
            .schedule_pipeline(&PipelineName::new(pipeline), BuildCause::forced_by("tester"))
            .await
            .expect("pipeline can be scheduled")
            .expect("no run was active")
    }

    /// Register an agent by hand: get a cookie and ping once.
    pub async fn connect(&self, resources: &[&str]) -> AgentInfo {
        let info = AgentInfo::new(AgentId::new(), "test-host").with_resources(resources.iter().copied());
        let cookie = self.dispatcher.get_cookie(&info).await.expect("cookie issued");
        let info = info.with_cookie(cookie);
        self.dispatcher.ping(&info).await.expect("ping accepted");
        info
    }

    /// An agent controller talking to this dispatcher, with its identity and
    /// workspaces in a fresh temporary directory.
    pub fn agent(&self, resources: &[&str]) -> TestAgent {
        let dir = tempfile::tempdir().expect("temporary directory");
        let config = AgentConfig {
            hostname: "controller-host".to_string(),
            resources: resources.iter().map(|r| r.to_string()).collect(),
            ping_interval_secs: 1,
            work_poll_interval_secs: 1,
            identity_dir: dir.path().join("config"),
            workspace_dir: dir.path().join("pipelines"),
            ..Default::default()
        };
        let protocol: Arc<dyn AgentProtocol> = self.dispatcher.clone();
        let controller = AgentController::new(config, protocol).expect("agent identity");

        TestAgent {
            controller: Arc::new(controller),
            _dir: dir,
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// An agent controller plus the directory backing it.
pub struct TestAgent {
    pub controller: Arc<AgentController>,
    _dir: TempDir,
}

impl std::ops::Deref for TestAgent {
    type Target = AgentController;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}
