//! Build agent for Drover CI.
//!
//! The agent keeps a persistent identity, pings the server, polls for work
//! and runs the tasks of each assigned job in its own workspace.

pub mod config;
pub mod controller;
pub mod executor;
pub mod identity;

pub use config::AgentConfig;
pub use controller::AgentController;
pub use executor::{JobExecutor, TaskOutcome};
pub use identity::IdentityError;
