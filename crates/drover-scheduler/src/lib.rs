//! Drover Scheduler
//!
//! Pipeline dependency resolution, job lifecycle tracking, and the agent
//! registry and work dispatcher that serve the agent protocol.

pub mod board;
pub mod config;
pub mod dag;
pub mod dispatcher;
pub mod lifecycle;
pub mod liveness;
pub mod matching;
pub mod registry;
pub mod triggers;

pub use board::JobBoard;
pub use config::DispatchConfig;
pub use dag::{DagError, PipelineGraph, PipelineNode};
pub use dispatcher::WorkDispatcher;
pub use lifecycle::BuildLifecycleTracker;
pub use liveness::LivenessMonitor;
pub use registry::AgentRegistry;
