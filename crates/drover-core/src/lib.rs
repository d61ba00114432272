//! Drover Core
//!
//! Core domain types, the agent protocol, ports and error handling for
//! Drover. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod agent;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod memory;
pub mod pipeline;
pub mod ports;
pub mod protocol;
pub mod work;

pub use error::{Error, Result};
pub use ids::*;
