//! Registry of known agents.
//!
//! Updates for different agents never contend beyond the concurrent map's
//! shard locks. Map guards are always released before the store is awaited.

use crate::config::DispatchConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use drover_core::agent::{Agent, AgentConfigState, AgentInfo, AgentRuntimeStatus};
use drover_core::ids::{AgentId, Cookie, JobIdentifier};
use drover_core::ports::AgentStore;
use drover_core::work::AgentInstruction;
use drover_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether an agent's request may be served.
#[derive(Debug, Clone)]
pub enum Authorization {
    Registered(Agent),
    /// Unknown agent, stale cookie, or not yet approved.
    Unregistered,
    Denied,
}

/// Result of a ping.
#[derive(Debug, Clone)]
pub struct PingOutcome {
    pub instruction: AgentInstruction,
    /// Set when this ping created the agent.
    pub registered: Option<Agent>,
}

pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    store: Arc<dyn AgentStore>,
    config: DispatchConfig,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn AgentStore>, config: DispatchConfig) -> Self {
        Self {
            agents: DashMap::new(),
            store,
            config,
        }
    }

    /// Reload persisted agents. Returns how many were loaded.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.load_all().await?;
        let count = records.len();
        for record in records {
            self.agents.insert(record.id, Agent::from_record(record));
        }
        info!(count, "Loaded agents from store");
        Ok(count)
    }

    /// Find the agent for a request, creating it on first contact. Returns
    /// `None` if it is unknown and the pending limit has been reached.
    async fn upsert(&self, info: &AgentInfo) -> Result<Option<(Agent, bool)>> {
        if let Some(mut agent) = self.agents.get_mut(&info.id) {
            agent.hostname = info.hostname.clone();
            if info.ip_address.is_some() {
                agent.ip_address = info.ip_address.clone();
            }
            if info.location.is_some() {
                agent.location = info.location.clone();
            }
            return Ok(Some((agent.clone(), false)));
        }

        let state = if self.config.auto_register {
            AgentConfigState::Enabled
        } else if self.pending_count() < self.config.max_pending_agents {
            AgentConfigState::Pending
        } else {
            warn!(
                agent_id = %info.id,
                hostname = %info.hostname,
                limit = self.config.max_pending_agents,
                "Pending agent limit reached, not recording agent"
            );
            return Ok(None);
        };

        let (agent, created) = match self.agents.entry(info.id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let agent = Agent::from_info(info, state);
                entry.insert(agent.clone());
                (agent, true)
            }
        };

        if created {
            self.store.save(&agent.record()).await?;
            info!(
                agent_id = %agent.id,
                hostname = %agent.hostname,
                state = ?agent.config_state,
                "Agent registered"
            );
        }

        Ok(Some((agent, created)))
    }

    /// Record that an agent is alive and work out its instruction.
    pub async fn ping(&self, info: &AgentInfo) -> Result<PingOutcome> {
        let Some((_, created)) = self.upsert(info).await? else {
            return Ok(PingOutcome {
                instruction: AgentInstruction::None,
                registered: None,
            });
        };

        let now = Utc::now();
        let kill_after = self.config.kill_running_tasks_after();

        let mut agent = self
            .agents
            .get_mut(&info.id)
            .ok_or_else(|| Error::AgentNotFound(info.id.to_string()))?;
        agent.last_heard_at = Some(now);

        if !agent.owns_cookie(info.cookie.as_ref()) {
            debug!(agent_id = %info.id, "Ignoring status from agent without a current cookie");
            return Ok(PingOutcome {
                instruction: AgentInstruction::None,
                registered: created.then(|| agent.clone()),
            });
        }

        match (agent.runtime_status, info.runtime_status) {
            // A cancelled agent stays cancelled until it reports idle.
            (AgentRuntimeStatus::Cancelled, AgentRuntimeStatus::Building)
            | (AgentRuntimeStatus::Cancelled, AgentRuntimeStatus::Cancelled) => {}
            (_, AgentRuntimeStatus::Idle) => {
                agent.runtime_status = AgentRuntimeStatus::Idle;
                agent.current_job = None;
                agent.cancelled_at = None;
            }
            (_, reported) => agent.runtime_status = reported,
        }

        let instruction = match (agent.runtime_status, agent.cancelled_at) {
            (AgentRuntimeStatus::Cancelled, Some(at)) if now - at >= kill_after => {
                AgentInstruction::KillRunningTasks
            }
            (AgentRuntimeStatus::Cancelled, _) => AgentInstruction::CancelJob,
            _ => AgentInstruction::None,
        };

        Ok(PingOutcome {
            instruction,
            registered: created.then(|| agent.clone()),
        })
    }

    /// Issue a new cookie for a freshly started agent process.
    pub async fn assign_cookie(&self, info: &AgentInfo) -> Result<Cookie> {
        let cookie = Cookie::generate();
        if self.upsert(info).await?.is_none() {
            return Ok(cookie);
        }

        let record = {
            let mut agent = self
                .agents
                .get_mut(&info.id)
                .ok_or_else(|| Error::AgentNotFound(info.id.to_string()))?;
            agent.cookie = Some(cookie.clone());
            agent.record()
        };
        self.store.save(&record).await?;
        debug!(agent_id = %info.id, "Issued cookie");
        Ok(cookie)
    }

    pub fn authorize(&self, info: &AgentInfo) -> Authorization {
        let Some(agent) = self.agents.get(&info.id) else {
            return Authorization::Unregistered;
        };
        if !agent.owns_cookie(info.cookie.as_ref()) {
            return Authorization::Unregistered;
        }
        match agent.config_state {
            AgentConfigState::Pending => Authorization::Unregistered,
            AgentConfigState::Disabled => Authorization::Denied,
            AgentConfigState::Enabled => Authorization::Registered(agent.clone()),
        }
    }

    /// Whether a request comes from the current incarnation of an approved
    /// agent.
    pub fn is_current(&self, info: &AgentInfo) -> bool {
        self.agents
            .get(&info.id)
            .is_some_and(|a| a.is_registered() && a.owns_cookie(info.cookie.as_ref()))
    }

    pub async fn approve(&self, id: AgentId) -> Result<Agent> {
        let agent = self.update(id, |agent| {
            if agent.config_state == AgentConfigState::Pending {
                agent.config_state = AgentConfigState::Enabled;
            }
        })?;
        self.store.save(&agent.record()).await?;
        info!(agent_id = %id, "Agent approved");
        Ok(agent)
    }

    pub async fn enable(&self, id: AgentId) -> Result<Agent> {
        let agent = self.update(id, |agent| agent.config_state = AgentConfigState::Enabled)?;
        self.store.save(&agent.record()).await?;
        info!(agent_id = %id, "Agent enabled");
        Ok(agent)
    }

    pub async fn disable(&self, id: AgentId) -> Result<Agent> {
        let agent = self.update(id, |agent| agent.config_state = AgentConfigState::Disabled)?;
        self.store.save(&agent.record()).await?;
        info!(agent_id = %id, "Agent disabled");
        Ok(agent)
    }

    /// Remove an agent. Only disabled agents that are not building can be
    /// deleted.
    pub async fn delete(&self, id: AgentId) -> Result<Agent> {
        let removed = self
            .agents
            .remove_if(&id, |_, agent| agent.is_disabled() && !agent.is_building());

        match removed {
            Some((_, agent)) => {
                self.store.delete(id).await?;
                info!(agent_id = %id, "Agent deleted");
                Ok(agent)
            }
            None if self.agents.contains_key(&id) => Err(Error::AgentInUse(id.to_string())),
            None => Err(Error::AgentNotFound(id.to_string())),
        }
    }

    pub fn mark_building(&self, id: AgentId, job: &JobIdentifier) {
        let _ = self.update(id, |agent| {
            agent.runtime_status = AgentRuntimeStatus::Building;
            agent.current_job = Some(job.clone());
        });
    }

    /// Return an agent to idle after its job finished.
    pub fn release(&self, id: AgentId) {
        let _ = self.update(id, |agent| {
            agent.runtime_status = AgentRuntimeStatus::Idle;
            agent.current_job = None;
            agent.cancelled_at = None;
        });
    }

    /// The agent's job was cancelled while it was running it.
    pub fn mark_cancelled(&self, id: AgentId) {
        let _ = self.update(id, |agent| {
            agent.runtime_status = AgentRuntimeStatus::Cancelled;
            agent.cancelled_at = Some(Utc::now());
        });
    }

    pub fn clear_job(&self, id: AgentId) {
        let _ = self.update(id, |agent| agent.current_job = None);
    }

    /// Mark agents not heard from within the connection timeout as lost.
    /// Disabled agents are never marked. Returns the newly lost agents.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Agent> {
        let timeout = self.config.agent_connection_timeout();
        let mut lost = Vec::new();

        for mut entry in self.agents.iter_mut() {
            let agent = entry.value_mut();
            if agent.is_disabled() || agent.runtime_status == AgentRuntimeStatus::LostContact {
                continue;
            }
            let last = agent.last_heard_at.unwrap_or(agent.registered_at);
            if now - last > timeout {
                agent.runtime_status = AgentRuntimeStatus::LostContact;
                lost.push(agent.clone());
            }
        }

        lost
    }

    fn update(&self, id: AgentId, f: impl FnOnce(&mut Agent)) -> Result<Agent> {
        let mut agent = self
            .agents
            .get_mut(&id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        f(&mut agent);
        Ok(agent.clone())
    }

    pub fn get(&self, id: AgentId) -> Option<Agent> {
        self.agents.get(&id).map(|a| a.clone())
    }

    /// All agents, oldest registration first.
    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<_> = self.agents.iter().map(|a| a.clone()).collect();
        agents.sort_by_key(|a| a.registered_at);
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.config_state == AgentConfigState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::memory::InMemoryAgentStore;

    fn registry(config: DispatchConfig) -> (AgentRegistry, Arc<InMemoryAgentStore>) {
        let store = Arc::new(InMemoryAgentStore::new());
        (AgentRegistry::new(store.clone(), config), store)
    }

    async fn connect(registry: &AgentRegistry, hostname: &str) -> AgentInfo {
        let info = AgentInfo::new(AgentId::new(), hostname);
        let cookie = registry.assign_cookie(&info).await.unwrap();
        info.with_cookie(cookie)
    }

    #[tokio::test]
    async fn test_first_ping_registers_agent() {
        let (registry, store) = registry(DispatchConfig::default());
        let info = AgentInfo::new(AgentId::new(), "host-1");

        let outcome = registry.ping(&info).await.unwrap();
        assert!(outcome.registered.is_some());
        assert_eq!(outcome.instruction, AgentInstruction::None);
        assert_eq!(store.len(), 1);

        let outcome = registry.ping(&info).await.unwrap();
        assert!(outcome.registered.is_none());
        assert!(registry.get(info.id).unwrap().last_heard_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_cookie_is_unregistered() {
        let (registry, _) = registry(DispatchConfig::default());
        let info = connect(&registry, "host-1").await;
        assert!(matches!(registry.authorize(&info), Authorization::Registered(_)));

        // A restarted process gets a new cookie; the old one is no longer valid.
        let restarted = AgentInfo::new(info.id, "host-1");
        let fresh = registry.assign_cookie(&restarted).await.unwrap();
        assert!(matches!(registry.authorize(&info), Authorization::Unregistered));
        assert!(matches!(
            registry.authorize(&restarted.with_cookie(fresh)),
            Authorization::Registered(_)
        ));
    }

    #[tokio::test]
    async fn test_pending_agents_need_approval() {
        let config = DispatchConfig {
            auto_register: false,
            ..Default::default()
        };
        let (registry, _) = registry(config);
        let info = connect(&registry, "host-1").await;

        assert!(matches!(registry.authorize(&info), Authorization::Unregistered));
        registry.approve(info.id).await.unwrap();
        assert!(matches!(registry.authorize(&info), Authorization::Registered(_)));
    }

    #[tokio::test]
    async fn test_pending_limit() {
        let config = DispatchConfig {
            auto_register: false,
            max_pending_agents: 2,
            ..Default::default()
        };
        let (registry, _) = registry(config);
        for i in 0..3 {
            connect(&registry, &format!("host-{}", i)).await;
        }
        assert_eq!(registry.pending_count(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_agent_is_denied() {
        let (registry, _) = registry(DispatchConfig::default());
        let info = connect(&registry, "host-1").await;
        registry.disable(info.id).await.unwrap();
        assert!(matches!(registry.authorize(&info), Authorization::Denied));

        registry.enable(info.id).await.unwrap();
        assert!(matches!(registry.authorize(&info), Authorization::Registered(_)));
    }

    #[tokio::test]
    async fn test_cancelled_agent_stays_cancelled_while_building() {
        let (registry, _) = registry(DispatchConfig::default());
        let info = connect(&registry, "host-1").await;
        let building = info.clone().with_status(AgentRuntimeStatus::Building);

        registry.ping(&building).await.unwrap();
        registry.mark_cancelled(info.id);

        let outcome = registry.ping(&building).await.unwrap();
        assert_eq!(outcome.instruction, AgentInstruction::CancelJob);
        assert_eq!(
            registry.get(info.id).unwrap().runtime_status,
            AgentRuntimeStatus::Cancelled
        );

        let idle = info.with_status(AgentRuntimeStatus::Idle);
        let outcome = registry.ping(&idle).await.unwrap();
        assert_eq!(outcome.instruction, AgentInstruction::None);
        assert_eq!(
            registry.get(idle.id).unwrap().runtime_status,
            AgentRuntimeStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let config = DispatchConfig {
            kill_running_tasks_after_secs: 0,
            ..Default::default()
        };
        let (registry, _) = registry(config);
        let info = connect(&registry, "host-1")
            .await
            .with_status(AgentRuntimeStatus::Building);
        registry.ping(&info).await.unwrap();
        registry.mark_cancelled(info.id);

        let outcome = registry.ping(&info).await.unwrap();
        assert_eq!(outcome.instruction, AgentInstruction::KillRunningTasks);
    }

    #[tokio::test]
    async fn test_delete_requires_disabled_idle_agent() {
        let (registry, store) = registry(DispatchConfig::default());
        let info = connect(&registry, "host-1").await;

        assert!(matches!(
            registry.delete(info.id).await,
            Err(Error::AgentInUse(_))
        ));

        registry.disable(info.id).await.unwrap();
        registry.delete(info.id).await.unwrap();
        assert!(registry.get(info.id).is_none());
        assert!(store.is_empty());
        assert!(matches!(
            registry.delete(info.id).await,
            Err(Error::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_skips_disabled_agents() {
        let config = DispatchConfig {
            agent_connection_timeout_secs: 5,
            ..Default::default()
        };
        let (registry, _) = registry(config);
        let live = connect(&registry, "live").await;
        let disabled = connect(&registry, "disabled").await;
        registry.ping(&live).await.unwrap();
        registry.ping(&disabled).await.unwrap();
        registry.disable(disabled.id).await.unwrap();

        assert!(registry.sweep(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(60);
        let lost = registry.sweep(later);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].id, live.id);
        assert!(registry.sweep(later).is_empty());
    }

    #[tokio::test]
    async fn test_identity_survives_reload() {
        let store = Arc::new(InMemoryAgentStore::new());
        let first = AgentRegistry::new(store.clone(), DispatchConfig::default());
        let info = connect(&first, "host-1").await;

        let second = AgentRegistry::new(store, DispatchConfig::default());
        assert_eq!(second.load().await.unwrap(), 1);
        assert!(matches!(second.authorize(&info), Authorization::Registered(_)));
    }
}
