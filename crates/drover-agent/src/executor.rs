//! Task execution for assigned jobs.

use drover_core::Result;
use drover_core::ids::JobIdentifier;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How a single task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Passed,
    Failed { exit_code: Option<i32> },
    /// The job was cancelled while the task ran; the process was killed.
    Cancelled,
}

/// Runs job tasks with `sh -c` inside per-job workspaces.
pub struct JobExecutor {
    workspace_dir: PathBuf,
}

impl JobExecutor {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }

    /// Workspace path for a job, unique per pipeline and stage run.
    pub fn workspace_for(&self, job: &JobIdentifier) -> PathBuf {
        self.workspace_dir
            .join(job.pipeline_name.key())
            .join(job.pipeline_counter.to_string())
            .join(&job.stage_name)
            .join(job.stage_counter.to_string())
            .join(&job.job_name)
    }

    pub async fn setup_workspace(&self, job: &JobIdentifier) -> Result<PathBuf> {
        let workspace = self.workspace_for(job);
        fs::create_dir_all(&workspace).await.map_err(|e| {
            drover_core::Error::Internal(format!("Failed to create workspace: {}", e))
        })?;

        debug!(path = %workspace.display(), "Workspace created");
        Ok(workspace)
    }

    pub async fn cleanup_workspace(&self, workspace: &Path) {
        if workspace.exists()
            && let Err(e) = fs::remove_dir_all(workspace).await
        {
            warn!(path = %workspace.display(), error = %e, "Failed to cleanup workspace");
        }
    }

    /// Run one task. A `true` on `cancel` kills the process and yields
    /// [`TaskOutcome::Cancelled`].
    pub async fn run_task(
        &self,
        command: &str,
        workspace: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<TaskOutcome> {
        if *cancel.borrow() {
            return Ok(TaskOutcome::Cancelled);
        }

        info!(command = %command, workspace = %workspace.display(), "Executing task");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| drover_core::Error::Internal(format!("Failed to spawn task: {}", e)))?;

        // Dropping the output future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output,
            _ = cancelled(cancel) => {
                warn!(command = %command, "Task killed after cancellation");
                return Ok(TaskOutcome::Cancelled);
            }
        };

        let output = output
            .map_err(|e| drover_core::Error::Internal(format!("Failed to wait for task: {}", e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(stream = "stdout", "{}", line);
        }

        if output.status.success() {
            Ok(TaskOutcome::Passed)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                command = %command,
                exit_code = ?output.status.code(),
                stderr = %stderr.trim_end(),
                "Task failed"
            );
            Ok(TaskOutcome::Failed {
                exit_code: output.status.code(),
            })
        }
    }
}

/// Resolves once cancellation is requested; never resolves if the sender is
/// gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job() -> JobIdentifier {
        JobIdentifier::new("Api", 4, "build", 1, "compile")
    }

    #[test]
    fn test_workspace_layout() {
        let executor = JobExecutor::new(PathBuf::from("/work"));
        assert_eq!(
            executor.workspace_for(&job()),
            PathBuf::from("/work/api/4/build/1/compile")
        );
    }

    #[tokio::test]
    async fn test_task_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JobExecutor::new(dir.path().to_path_buf());
        let workspace = executor.setup_workspace(&job()).await.unwrap();
        let (_tx, mut rx) = watch::channel(false);

        let outcome = executor
            .run_task("echo built > artifact.txt", &workspace, &mut rx)
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Passed);
        let artifact = std::fs::read_to_string(workspace.join("artifact.txt")).unwrap();
        assert_eq!(artifact.trim(), "built");

        executor.cleanup_workspace(&workspace).await;
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_failing_task_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JobExecutor::new(dir.path().to_path_buf());
        let (_tx, mut rx) = watch::channel(false);

        let outcome = executor.run_task("exit 3", dir.path(), &mut rx).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Failed { exit_code: Some(3) });
    }

    #[tokio::test]
    async fn test_cancel_kills_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JobExecutor::new(dir.path().to_path_buf());
        let (tx, mut rx) = watch::channel(false);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(true).unwrap();
            tx
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            executor.run_task("sleep 30", dir.path(), &mut rx),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        drop(cancel.await.unwrap());
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let executor = JobExecutor::new(dir.path().to_path_buf());
        let (_tx, mut rx) = watch::channel(true);

        let outcome = executor
            .run_task("touch should-not-exist", dir.path(), &mut rx)
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(!dir.path().join("should-not-exist").exists());
    }
}
