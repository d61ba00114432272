//! Registry of supervised OS processes, keyed by tag.

use crate::error::{Result, SupervisorError};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared "last seen" timestamp of a process, refreshed by output capture.
#[derive(Debug, Clone)]
pub struct Activity(Arc<Mutex<DateTime<Utc>>>);

impl Activity {
    fn new(at: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(at)))
    }

    pub fn touch(&self) {
        *self.0.lock() = Utc::now();
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

struct ProcessEntry {
    incarnation: u64,
    pid: Option<u32>,
    command: String,
    started_at: DateTime<Utc>,
    activity: Activity,
    kill_tx: watch::Sender<bool>,
}

/// Diagnostic view of one registered process.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub tag: String,
    pub incarnation: u64,
    pub pid: Option<u32>,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Concurrency-safe map from tag to running process.
///
/// An entry leaves the map exactly once: through [`ProcessManager::kill`] or
/// when the process that owns it is reaped after exiting on its own.
#[derive(Default)]
pub struct ProcessManager {
    processes: DashMap<String, ProcessEntry>,
    incarnations: AtomicU64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `args` and register it under `tag`. A process already
    /// registered under the same tag is killed first.
    pub fn spawn(
        self: &Arc<Self>,
        tag: &str,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> Result<RunningProcess> {
        let (program, rest) = args.split_first().ok_or(SupervisorError::EmptyCommand)?;
        let command_line = args.join(" ");

        let mut command = Command::new(program);
        command
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let incarnation = self.incarnations.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();
        let activity = Activity::new(started_at);
        let (kill_tx, kill_rx) = watch::channel(false);
        let pid = child.id();

        let previous = self.processes.insert(
            tag.to_string(),
            ProcessEntry {
                incarnation,
                pid,
                command: command_line.clone(),
                started_at,
                activity: activity.clone(),
                kill_tx,
            },
        );
        if let Some(previous) = previous {
            warn!(tag, incarnation = previous.incarnation, "Replacing registered process");
            previous.kill_tx.send_replace(true);
        }

        info!(tag, incarnation, pid = ?pid, command = %command_line, "Process started");

        Ok(RunningProcess {
            tag: tag.to_string(),
            incarnation,
            child,
            activity,
            kill_rx,
            manager: Arc::clone(self),
        })
    }

    /// Remove `tag` and terminate its process. Returns false if nothing was
    /// registered under the tag.
    pub fn kill(&self, tag: &str) -> bool {
        match self.processes.remove(tag) {
            Some((_, entry)) => {
                info!(tag, incarnation = entry.incarnation, "Killing process");
                entry.kill_tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Kill every registered process. Returns how many were killed.
    pub fn kill_all(&self) -> usize {
        let tags: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        tags.iter().filter(|tag| self.kill(tag)).count()
    }

    /// Time since the process last produced output, or since it started.
    pub fn idle_time(&self, tag: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.processes
            .get(tag)
            .map(|entry| now - entry.activity.last_active_at())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.processes.contains_key(tag)
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut list: Vec<ProcessInfo> = self
            .processes
            .iter()
            .map(|entry| ProcessInfo {
                tag: entry.key().clone(),
                incarnation: entry.incarnation,
                pid: entry.pid,
                command: entry.command.clone(),
                started_at: entry.started_at,
                last_active_at: entry.activity.last_active_at(),
            })
            .collect();
        list.sort_by(|a, b| a.tag.cmp(&b.tag));
        list
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Drop the entry for `tag` if it still belongs to `incarnation`.
    fn reap(&self, tag: &str, incarnation: u64) -> bool {
        let removed = self
            .processes
            .remove_if(tag, |_, entry| entry.incarnation == incarnation)
            .is_some();
        if removed {
            debug!(tag, incarnation, "Reaped exited process");
        }
        removed
    }
}

/// A spawned process owned by its supervisor.
pub struct RunningProcess {
    tag: String,
    incarnation: u64,
    child: Child,
    activity: Activity,
    kill_rx: watch::Receiver<bool>,
    manager: Arc<ProcessManager>,
}

impl RunningProcess {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn activity(&self) -> Activity {
        self.activity.clone()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the process to exit, killing it if its tag is killed
    /// meanwhile, then reap its registry entry.
    pub async fn wait(self) -> Result<ExitStatus> {
        let RunningProcess {
            tag,
            incarnation,
            mut child,
            mut kill_rx,
            manager,
            ..
        } = self;

        let killed = async move {
            if kill_rx.wait_for(|k| *k).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = killed => {
                child.kill().await?;
                child.wait().await
            }
        }?;

        manager.reap(&tag, incarnation);
        Ok(status)
    }
}
