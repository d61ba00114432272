//! Process supervisor for Drover CI agents.
//!
//! Keeps a designated command running, restarting it on every exit, and
//! captures its output into per-tag log files.

pub mod capture;
pub mod error;
pub mod hook;
pub mod output;
pub mod process;
pub mod supervisor;
pub mod variables;

pub use capture::{LineSink, LogFileSink, LogRotation, MemorySink, StreamPump};
pub use error::{Result, SupervisorError};
pub use hook::ShutdownHook;
pub use output::{OutputLine, OutputStream};
pub use process::{Activity, ProcessInfo, ProcessManager, RunningProcess};
pub use supervisor::{LogDirSinks, ProcessSupervisor, SinkProvider, SupervisorConfig};
pub use variables::{CommandSpec, VariableContext};
