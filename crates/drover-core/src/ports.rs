//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and
//! external adapters.

use crate::Result;
use crate::agent::AgentRecord;
use crate::events::Event;
use crate::ids::{AgentId, PipelineName};
use crate::job::BuildAssignment;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `job.*.completed`, `agent.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Durable store for agent identity and configuration.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert or replace an agent record.
    async fn save(&self, record: &AgentRecord) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<AgentRecord>>;

    async fn delete(&self, id: AgentId) -> Result<()>;
}

/// Receives finished job assignments.
#[async_trait]
pub trait JobArchive: Send + Sync {
    /// Archive a terminal assignment. Called once per job run.
    async fn archive(&self, assignment: &BuildAssignment) -> Result<()>;

    /// Archived jobs of a pipeline, most recent first.
    async fn history(&self, pipeline: &PipelineName, limit: usize) -> Result<Vec<BuildAssignment>>;
}
