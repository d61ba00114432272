//! Agent configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the server the agent talks to.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Hostname reported to the server.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Resources offered for job matching.
    #[serde(default)]
    pub resources: Vec<String>,
    /// Environments this agent serves. Empty means jobs without an
    /// environment only.
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Back-off between `get_work` calls that returned no build.
    #[serde(default = "default_work_poll_interval")]
    pub work_poll_interval_secs: u64,
    /// Directory holding the persistent agent identity.
    #[serde(default = "default_identity_dir")]
    pub identity_dir: PathBuf,
    /// Directory under which per-job workspaces are created.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

fn default_server_url() -> String {
    "https://localhost:8154/go".to_string()
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_ping_interval() -> u64 {
    10
}

fn default_work_poll_interval() -> u64 {
    5
}

fn default_identity_dir() -> PathBuf {
    PathBuf::from("/var/lib/drover/config")
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("/var/lib/drover/pipelines")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            hostname: default_hostname(),
            resources: vec![],
            environments: vec![],
            ping_interval_secs: default_ping_interval(),
            work_poll_interval_secs: default_work_poll_interval(),
            identity_dir: default_identity_dir(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn work_poll_interval(&self) -> Duration {
        Duration::from_secs(self.work_poll_interval_secs)
    }
}
