//! Dispatcher configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side agent dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds without a ping before an agent is considered lost.
    #[serde(default = "default_agent_connection_timeout")]
    pub agent_connection_timeout_secs: u64,
    /// How often the liveness sweep runs.
    #[serde(default = "default_liveness_sweep_interval")]
    pub liveness_sweep_interval_secs: u64,
    /// Enable unknown agents on first contact instead of holding them pending.
    #[serde(default = "default_auto_register")]
    pub auto_register: bool,
    #[serde(default = "default_max_pending_agents")]
    pub max_pending_agents: usize,
    /// Seconds a cancelled agent may keep building before it is told to
    /// kill its running tasks.
    #[serde(default = "default_kill_running_tasks_after")]
    pub kill_running_tasks_after_secs: u64,
}

fn default_agent_connection_timeout() -> u64 {
    300
}

fn default_liveness_sweep_interval() -> u64 {
    10
}

fn default_auto_register() -> bool {
    true
}

fn default_max_pending_agents() -> usize {
    100
}

fn default_kill_running_tasks_after() -> u64 {
    60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            agent_connection_timeout_secs: default_agent_connection_timeout(),
            liveness_sweep_interval_secs: default_liveness_sweep_interval(),
            auto_register: default_auto_register(),
            max_pending_agents: default_max_pending_agents(),
            kill_running_tasks_after_secs: default_kill_running_tasks_after(),
        }
    }
}

impl DispatchConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn agent_connection_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.agent_connection_timeout_secs as i64)
    }

    pub fn kill_running_tasks_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.kill_running_tasks_after_secs as i64)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auto_register: false\nagent_connection_timeout_secs: 30").unwrap();

        let config = DispatchConfig::from_file(file.path()).unwrap();
        assert!(!config.auto_register);
        assert_eq!(config.agent_connection_timeout_secs, 30);
        assert_eq!(config.max_pending_agents, 100);
        assert_eq!(config.kill_running_tasks_after_secs, 60);
    }

    #[test]
    fn test_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auto_register: [not, a, bool]").unwrap();
        let err = DispatchConfig::from_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
