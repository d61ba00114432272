//! The supervise loop: keep one tagged process running until stopped.

use crate::capture::{LineSink, LogFileSink, LogRotation, StreamPump};
use crate::error::Result;
use crate::hook::ShutdownHook;
use crate::output::OutputStream;
use crate::process::{ProcessManager, RunningProcess};
use crate::variables::{CommandSpec, VariableContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Pause between an exit and the next spawn.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
    /// How long the final drain pass waits for buffered output.
    #[serde(default = "default_drain_window")]
    pub drain_window_ms: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Echo captured output to the supervisor's own stdout and stderr.
    #[serde(default = "default_echo_output")]
    pub echo_output: bool,
    #[serde(default)]
    pub log_rotation: LogRotation,
}

fn default_restart_delay() -> u64 {
    1000
}

fn default_drain_window() -> u64 {
    200
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_echo_output() -> bool {
    true
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay(),
            drain_window_ms: default_drain_window(),
            log_dir: default_log_dir(),
            echo_output: default_echo_output(),
            log_rotation: LogRotation::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }
}

/// Opens the sinks a supervised process writes to.
pub trait SinkProvider: Send + Sync {
    fn open(&self, tag: &str, stream: OutputStream) -> Result<Arc<dyn LineSink>>;
}

/// Per-tag rolling log files under one directory.
pub struct LogDirSinks {
    log_dir: PathBuf,
    rotation: LogRotation,
    echo: bool,
}

impl LogDirSinks {
    pub fn new(log_dir: impl AsRef<Path>, rotation: LogRotation, echo: bool) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            rotation,
            echo,
        }
    }
}

impl SinkProvider for LogDirSinks {
    fn open(&self, tag: &str, stream: OutputStream) -> Result<Arc<dyn LineSink>> {
        let sink = LogFileSink::open(&self.log_dir, tag, stream, self.rotation, self.echo)?;
        Ok(Arc::new(sink))
    }
}

/// Keeps one command running under a tag, restarting it whenever it exits.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    manager: Arc<ProcessManager>,
    context: VariableContext,
    sinks: Arc<dyn SinkProvider>,
    working_dir: Option<PathBuf>,
    hook: parking_lot::Mutex<Option<ShutdownHook>>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, manager: Arc<ProcessManager>) -> Self {
        let sinks = Arc::new(LogDirSinks::new(
            &config.log_dir,
            config.log_rotation,
            config.echo_output,
        ));
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            manager,
            context: VariableContext::from_env(),
            sinks,
            working_dir: None,
            hook: parking_lot::Mutex::new(None),
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Replace the shared variable context, by default the environment.
    pub fn with_context(mut self, context: VariableContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_sinks(mut self, sinks: Arc<dyn SinkProvider>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Run `spec` under `tag` until [`ProcessSupervisor::stop`] is called or
    /// the shutdown hook fires. Every exit, clean or not, and every spawn
    /// failure leads to a restart after the restart delay.
    pub async fn supervise(&self, tag: &str, spec: &CommandSpec) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut restarts = 0u64;
        self.arm_hook();

        info!(tag, "Starting supervise loop");

        while !*stop_rx.borrow() {
            match self.run_once(tag, spec).await {
                Ok(status) => {
                    warn!(tag, restarts, status = %status, "Supervised process exited, restarting");
                }
                Err(e) => {
                    error!(tag, restarts, error = %e, "Failed to run supervised process, retrying");
                }
            }
            restarts += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay()) => {}
                _ = stopped(&mut stop_rx) => {}
            }
        }

        info!(tag, restarts, "Supervise loop stopped");
    }

    /// Spawn `spec` once, capture its output and wait for it to exit. A stop
    /// request kills the process.
    pub async fn run_once(&self, tag: &str, spec: &CommandSpec) -> Result<ExitStatus> {
        let args = spec.resolve(&self.context);
        let mut process = self
            .manager
            .spawn(tag, &args, self.working_dir.as_deref())?;
        let pumps = self.attach(tag, &mut process);

        let mut stop_rx = self.stop_tx.subscribe();
        let waiting = process.wait();
        tokio::pin!(waiting);

        let status = tokio::select! {
            status = &mut waiting => status,
            _ = stopped(&mut stop_rx) => {
                self.manager.kill(tag);
                waiting.await
            }
        };

        for pump in pumps {
            pump.join().await;
        }
        status
    }

    fn attach(&self, tag: &str, process: &mut RunningProcess) -> Vec<StreamPump> {
        let drain = self.config.drain_window();
        let mut pumps = Vec::with_capacity(2);

        if let Some(stdout) = process.take_stdout() {
            match self.sinks.open(tag, OutputStream::Stdout) {
                Ok(sink) => pumps.push(StreamPump::spawn(
                    stdout,
                    OutputStream::Stdout,
                    sink,
                    Some(process.activity()),
                    drain,
                )),
                Err(e) => error!(tag, error = %e, "Stdout will not be captured"),
            }
        }
        if let Some(stderr) = process.take_stderr() {
            match self.sinks.open(tag, OutputStream::Stderr) {
                Ok(sink) => pumps.push(StreamPump::spawn(
                    stderr,
                    OutputStream::Stderr,
                    sink,
                    Some(process.activity()),
                    drain,
                )),
                Err(e) => error!(tag, error = %e, "Stderr will not be captured"),
            }
        }
        pumps
    }

    fn arm_hook(&self) {
        let mut hook = self.hook.lock();
        if hook.is_none() {
            *hook = Some(ShutdownHook::install(
                Arc::clone(&self.manager),
                Arc::clone(&self.stop_tx),
            ));
        }
    }

    /// Arm the shutdown hook on `trigger` instead of SIGINT or SIGTERM. A
    /// later [`ProcessSupervisor::supervise`] keeps this hook.
    pub fn arm_hook_with<F>(&self, trigger: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let hook = ShutdownHook::install_with(
            Arc::clone(&self.manager),
            Arc::clone(&self.stop_tx),
            trigger,
        );
        if let Some(previous) = self.hook.lock().replace(hook) {
            previous.disarm();
        }
    }

    /// Begin an intentional shutdown: disarm the shutdown hook, stop the
    /// loop and kill the running process.
    pub fn stop(&self) {
        if let Some(hook) = self.hook.lock().take() {
            hook.disarm();
        }
        info!("Stopping supervisor");
        self.stop_tx.send_replace(true);
    }
}

async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}
