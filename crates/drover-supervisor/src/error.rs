//! Supervisor errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Command line is empty")]
    EmptyCommand,

    #[error("Failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open log sink for {tag}: {source}")]
    Sink {
        tag: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
