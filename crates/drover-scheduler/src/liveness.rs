//! Periodic sweep that reclaims work from agents that stopped pinging.

use crate::dispatcher::WorkDispatcher;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Liveness sweep loop. Agents are only marked lost, and their jobs only
/// requeued, by this loop and never by their own requests.
pub struct LivenessMonitor {
    dispatcher: Arc<WorkDispatcher>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(dispatcher: Arc<WorkDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting liveness monitor"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Liveness monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.dispatcher.sweep_lost_agents(Utc::now()).await {
            Ok(lost) if lost.is_empty() => debug!("Liveness sweep found no lost agents"),
            Ok(lost) => info!(count = lost.len(), "Liveness sweep reclaimed lost agents"),
            Err(e) => error!(error = %e, "Liveness sweep failed"),
        }
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use drover_core::agent::AgentInfo;
    use drover_core::ids::AgentId;
    use drover_core::memory::{BroadcastEventBus, InMemoryAgentStore, InMemoryJobArchive};
    use drover_core::protocol::AgentProtocol;

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let dispatcher = Arc::new(WorkDispatcher::build(
            DispatchConfig::default(),
            Arc::new(InMemoryAgentStore::new()),
            Arc::new(InMemoryJobArchive::new()),
            Arc::new(BroadcastEventBus::new()),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = LivenessMonitor::new(dispatcher, Duration::from_millis(10)).spawn(rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_marks_silent_agents_lost() {
        let config = DispatchConfig {
            agent_connection_timeout_secs: 0,
            ..Default::default()
        };
        let dispatcher = Arc::new(WorkDispatcher::build(
            config,
            Arc::new(InMemoryAgentStore::new()),
            Arc::new(InMemoryJobArchive::new()),
            Arc::new(BroadcastEventBus::new()),
        ));
        let info = AgentInfo::new(AgentId::new(), "quiet");
        dispatcher.ping(&info).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = LivenessMonitor::new(dispatcher.clone(), Duration::from_millis(10)).spawn(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let agent = dispatcher.registry().get(info.id).unwrap();
        assert_eq!(
            agent.runtime_status,
            drover_core::agent::AgentRuntimeStatus::LostContact
        );
    }
}
