//! Agent types.

use crate::ids::{AgentId, Cookie, JobIdentifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-side view of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub location: Option<String>,
    pub resources: Vec<String>,
    pub environments: Vec<String>,
    pub cookie: Option<Cookie>,
    pub config_state: AgentConfigState,
    pub runtime_status: AgentRuntimeStatus,
    pub current_job: Option<JobIdentifier>,
    pub registered_at: DateTime<Utc>,
    pub last_heard_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Agent {
    /// Create an agent from its first contact with the server.
    pub fn from_info(info: &AgentInfo, config_state: AgentConfigState) -> Self {
        Self {
            id: info.id,
            hostname: info.hostname.clone(),
            ip_address: info.ip_address.clone(),
            location: info.location.clone(),
            resources: info.resources.clone(),
            environments: info.environments.clone(),
            cookie: None,
            config_state,
            runtime_status: AgentRuntimeStatus::Unknown,
            current_job: None,
            registered_at: Utc::now(),
            last_heard_at: None,
            cancelled_at: None,
        }
    }

    /// Rebuild an agent from its durable record. Nothing has been heard
    /// from it yet in this server's lifetime.
    pub fn from_record(record: AgentRecord) -> Self {
        Self {
            id: record.id,
            hostname: record.hostname,
            ip_address: record.ip_address,
            location: None,
            resources: record.resources,
            environments: record.environments,
            cookie: record.cookie,
            config_state: record.config_state,
            runtime_status: AgentRuntimeStatus::Unknown,
            current_job: None,
            registered_at: record.registered_at,
            last_heard_at: None,
            cancelled_at: None,
        }
    }

    pub fn record(&self) -> AgentRecord {
        AgentRecord {
            id: self.id,
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone(),
            resources: self.resources.clone(),
            environments: self.environments.clone(),
            cookie: self.cookie.clone(),
            config_state: self.config_state,
            registered_at: self.registered_at,
        }
    }

    /// Approved agents, enabled or not.
    pub fn is_registered(&self) -> bool {
        !matches!(self.config_state, AgentConfigState::Pending)
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.config_state, AgentConfigState::Disabled)
    }

    /// Whether the cookie presented by a request belongs to this agent's
    /// current incarnation.
    pub fn owns_cookie(&self, cookie: Option<&Cookie>) -> bool {
        matches!((&self.cookie, cookie), (Some(ours), Some(theirs)) if ours == theirs)
    }

    pub fn is_building(&self) -> bool {
        matches!(
            self.runtime_status,
            AgentRuntimeStatus::Building | AgentRuntimeStatus::Cancelled
        )
    }
}

/// Runtime status of an agent as last reported or inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRuntimeStatus {
    Unknown,
    Idle,
    Building,
    Cancelled,
    LostContact,
}

/// Administrative state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentConfigState {
    Pending,
    Enabled,
    Disabled,
}

/// Self-description an agent attaches to every protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub cookie: Option<Cookie>,
    pub runtime_status: AgentRuntimeStatus,
    /// Resources the agent asks to be registered with.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Environments the agent asks to be registered with.
    #[serde(default)]
    pub environments: Vec<String>,
}

impl AgentInfo {
    pub fn new(id: AgentId, hostname: impl Into<String>) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            ip_address: None,
            location: None,
            cookie: None,
            runtime_status: AgentRuntimeStatus::Idle,
            resources: vec![],
            environments: vec![],
        }
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_environments<I, S>(mut self, environments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environments = environments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: AgentRuntimeStatus) -> Self {
        self.runtime_status = status;
        self
    }
}

/// The part of an agent that must survive a server restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub resources: Vec<String>,
    pub environments: Vec<String>,
    pub cookie: Option<Cookie>,
    pub config_state: AgentConfigState,
    pub registered_at: DateTime<Utc>,
}
