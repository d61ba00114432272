//! Force-kill supervised processes when the supervisor itself is terminated.

use crate::process::ProcessManager;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Armed until an intentional shutdown begins. Disarming it first keeps the
/// hook and the orderly shutdown from both killing the same process.
///
/// Installing the hook replaces the default terminate action of SIGINT and
/// SIGTERM, so firing it also raises `stop`: the supervise loop must end
/// rather than respawn what was just killed.
pub struct ShutdownHook {
    armed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ShutdownHook {
    /// Kill every process in `manager` on SIGINT or SIGTERM.
    pub fn install(manager: Arc<ProcessManager>, stop: Arc<watch::Sender<bool>>) -> Self {
        Self::install_with(manager, stop, termination())
    }

    /// Raise `stop` and kill every process in `manager` once `trigger`
    /// resolves.
    pub fn install_with<F>(
        manager: Arc<ProcessManager>,
        stop: Arc<watch::Sender<bool>>,
        trigger: F,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let armed = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&armed);
        let task = tokio::spawn(async move {
            trigger.await;
            if flag.swap(false, Ordering::SeqCst) {
                stop.send_replace(true);
                let killed = manager.kill_all();
                warn!(killed, "Supervisor terminated, killed supervised processes");
            }
        });
        Self { armed, task }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Deregister the hook. Returns false if it already fired.
    pub fn disarm(self) -> bool {
        let was_armed = self.armed.swap(false, Ordering::SeqCst);
        self.task.abort();
        if was_armed {
            info!("Shutdown hook disarmed");
        }
        was_armed
    }
}

#[cfg(unix)]
async fn termination() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn sleeper(manager: &Arc<ProcessManager>, tag: &str) -> crate::process::RunningProcess {
        let args = vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        manager.spawn(tag, &args, None).unwrap()
    }

    fn stop_flag() -> Arc<watch::Sender<bool>> {
        Arc::new(watch::channel(false).0)
    }

    #[tokio::test]
    async fn test_fired_hook_kills_everything() {
        let manager = Arc::new(ProcessManager::new());
        let first = sleeper(&manager, "a");
        let second = sleeper(&manager, "b");
        let stop = stop_flag();

        let (tx, rx) = oneshot::channel::<()>();
        let hook = ShutdownHook::install_with(Arc::clone(&manager), Arc::clone(&stop), async move {
            let _ = rx.await;
        });
        tx.send(()).unwrap();

        for process in [first, second] {
            tokio::time::timeout(Duration::from_secs(5), process.wait())
                .await
                .unwrap()
                .unwrap();
        }
        assert!(manager.is_empty());
        assert!(*stop.borrow());
        assert!(!hook.is_armed());
        assert!(!hook.disarm());
    }

    #[tokio::test]
    async fn test_disarmed_hook_leaves_processes_alone() {
        let manager = Arc::new(ProcessManager::new());
        let _process = sleeper(&manager, "kept");
        let stop = stop_flag();

        let (tx, rx) = oneshot::channel::<()>();
        let hook = ShutdownHook::install_with(Arc::clone(&manager), Arc::clone(&stop), async move {
            let _ = rx.await;
        });
        assert!(hook.disarm());
        let _ = tx.send(());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.contains("kept"));
        assert!(!*stop.borrow());
        manager.kill_all();
    }
}
