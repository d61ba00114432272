//! In-memory adapters for the ports, used by tests and single-node setups.

use crate::agent::AgentRecord;
use crate::events::{Event, subject_matches};
use crate::ids::{AgentId, PipelineName};
use crate::job::BuildAssignment;
use crate::ports::{AgentStore, EventBus, EventStream, JobArchive};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;

const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Event bus backed by a tokio broadcast channel.
///
/// Publishing with no subscribers succeeds. A subscriber that falls behind by
/// more than the channel capacity receives an `EventBus` error item and then
/// continues with the newest events.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        // No receivers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = futures::stream::unfold(receiver, move |mut rx| {
            let pattern = pattern.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            return Some((Ok(event), rx));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            let err = Error::EventBus(format!("Subscriber lagged by {} events", n));
                            return Some((Err(err), rx));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Agent store held in a map.
#[derive(Default)]
pub struct InMemoryAgentStore {
    records: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, id: AgentId) -> Option<AgentRecord> {
        self.records.read().get(&id).cloned()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn save(&self, record: &AgentRecord) -> Result<()> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AgentRecord>> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.registered_at);
        Ok(records)
    }

    async fn delete(&self, id: AgentId) -> Result<()> {
        self.records.write().remove(&id);
        Ok(())
    }
}

/// Job archive held in a list, in archive order.
#[derive(Default)]
pub struct InMemoryJobArchive {
    jobs: RwLock<Vec<BuildAssignment>>,
}

impl InMemoryJobArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    pub fn all(&self) -> Vec<BuildAssignment> {
        self.jobs.read().clone()
    }
}

#[async_trait]
impl JobArchive for InMemoryJobArchive {
    async fn archive(&self, assignment: &BuildAssignment) -> Result<()> {
        if !assignment.state.is_terminal() {
            return Err(Error::Persistence(format!(
                "refusing to archive {} in state {}",
                assignment.job, assignment.state
            )));
        }
        self.jobs.write().push(assignment.clone());
        Ok(())
    }

    async fn history(&self, pipeline: &PipelineName, limit: usize) -> Result<Vec<BuildAssignment>> {
        Ok(self
            .jobs
            .read()
            .iter()
            .rev()
            .filter(|a| &a.job.pipeline_name == pipeline)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{JobScheduledPayload, PipelineCompletedPayload};
    use crate::ids::JobIdentifier;
    use crate::job::{JobOutcome, JobRequirements, JobState};
    use crate::pipeline::BuildCause;
    use chrono::Utc;
    use futures::StreamExt;

    fn finished(pipeline: &str, counter: u32) -> BuildAssignment {
        let mut a = BuildAssignment::new(
            JobIdentifier::new(pipeline, counter, "stage", 1, "job"),
            JobRequirements::default(),
            BuildCause::default(),
            vec![],
        );
        a.state = JobState::Completed(JobOutcome::Passed);
        a
    }

    #[tokio::test]
    async fn test_bus_filters_by_pattern() {
        let bus = BroadcastEventBus::new();
        let mut stream = bus.subscribe("pipeline.>").await.unwrap();

        bus.publish(Event::JobScheduled(JobScheduledPayload {
            job: JobIdentifier::new("a", 1, "s", 1, "j"),
            scheduled_at: Utc::now(),
        }))
        .await
        .unwrap();
        bus.publish(Event::PipelineCompleted(PipelineCompletedPayload {
            pipeline: PipelineName::new("a"),
            counter: 1,
            passed: true,
            completed_at: Utc::now(),
        }))
        .await
        .unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, Event::PipelineCompleted(_)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::new();
        let result = bus
            .publish(Event::JobScheduled(JobScheduledPayload {
                job: JobIdentifier::new("a", 1, "s", 1, "j"),
                scheduled_at: Utc::now(),
            }))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_archive_history_most_recent_first() {
        let archive = InMemoryJobArchive::new();
        archive.archive(&finished("a", 1)).await.unwrap();
        archive.archive(&finished("b", 1)).await.unwrap();
        archive.archive(&finished("A", 2)).await.unwrap();

        let history = archive.history(&PipelineName::new("a"), 10).await.unwrap();
        let counters: Vec<_> = history.iter().map(|a| a.job.pipeline_counter).collect();
        assert_eq!(counters, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_archive_rejects_active_jobs() {
        let archive = InMemoryJobArchive::new();
        let mut active = finished("a", 1);
        active.state = JobState::Building;
        assert!(archive.archive(&active).await.is_err());
        assert!(archive.is_empty());
    }
}
