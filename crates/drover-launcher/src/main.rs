//! Drover launcher entrypoint.
//!
//! Supervises the agent runtime until SIGINT or SIGTERM. Exits `0` after a
//! clean shutdown, [`UNCAUGHT_EXIT_CODE`] when the launcher itself fails or
//! panics, and with the agent's own exit code under `--once`.

use clap::Parser;
use drover_supervisor::{ProcessManager, ProcessSupervisor, VariableContext};
use std::future::Future;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use tracing::{error, info};

mod cli;
mod config;

use cli::Cli;
use config::LauncherConfig;

/// Exit code for errors the launcher could not handle.
const UNCAUGHT_EXIT_CODE: i32 = -273;

/// Registry tag of the agent runtime process.
const AGENT_TAG: &str = "agent";

const LAUNCHER_LOG: &str = "drover-launcher.log";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = guarded(launch(cli)).await;
    std::process::exit(code);
}

/// Run the launcher on its own task so a panic ends in
/// [`UNCAUGHT_EXIT_CODE`] like any other uncaught failure.
async fn guarded<F>(launch: F) -> i32
where
    F: Future<Output = i32> + Send + 'static,
{
    match tokio::spawn(launch).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Launcher panicked");
            eprintln!("drover-launcher: {e}");
            UNCAUGHT_EXIT_CODE
        }
    }
}

async fn launch(cli: Cli) -> i32 {
    let config = match LauncherConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("drover-launcher: {e}");
            return UNCAUGHT_EXIT_CODE;
        }
    };

    // Held until the end so buffered log lines are flushed before exit.
    let _guard = match setup_logging(&config.supervisor.log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("drover-launcher: failed to set up logging: {e:#}");
            return UNCAUGHT_EXIT_CODE;
        }
    };

    match run(&cli, config).await {
        Ok(code) => {
            info!(code, "Launcher exiting");
            code
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Launcher failed");
            UNCAUGHT_EXIT_CODE
        }
    }
}

async fn run(cli: &Cli, config: LauncherConfig) -> anyhow::Result<i32> {
    config.validate()?;

    let spec = config.command_spec();
    let context = VariableContext::from_env();
    info!(
        server_url = %config.server_url,
        ssl_verification_mode = %config.ssl_verification_mode,
        command = %spec.command_line(&context),
        "Starting agent launcher"
    );

    let manager = Arc::new(ProcessManager::new());
    let supervisor = Arc::new(
        ProcessSupervisor::new(config.supervisor.clone(), manager).with_context(context),
    );

    if cli.once {
        let task = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run_once(AGENT_TAG, &spec).await })
        };
        tokio::pin!(task);
        let status = tokio::select! {
            joined = &mut task => joined??,
            _ = shutdown_signal() => {
                supervisor.stop();
                task.await??
            }
        };
        return Ok(exit_code(status));
    }

    let task = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.supervise(AGENT_TAG, &spec).await })
    };

    shutdown_signal().await;
    info!("Shutdown signal received");
    supervisor.stop();
    task.await?;

    Ok(0)
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNCAUGHT_EXIT_CODE
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

fn setup_logging(log_dir: &Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LAUNCHER_LOG);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking))
        .try_init()?;

    Ok(guard)
}
