//! Supervisor restarting a real process and capturing its output to disk.

use drover_supervisor::{
    CommandSpec, LogDirSinks, LogRotation, ProcessManager, ProcessSupervisor, SupervisorConfig, VariableContext,
};
use drover_tests::wait_for;
use std::sync::Arc;
use std::time::Duration;

fn log_lines(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path)
        .map(|contents| contents.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_restarts_append_to_tag_log() {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig {
        restart_delay_ms: 20,
        drain_window_ms: 50,
        log_dir: dir.path().to_path_buf(),
        echo_output: false,
        log_rotation: LogRotation::Never,
    };
    let sinks = LogDirSinks::new(dir.path(), LogRotation::Never, false);
    let supervisor = Arc::new(
        ProcessSupervisor::new(config, Arc::new(ProcessManager::new()))
            .with_context(VariableContext::new().with("GREETING", "hello"))
            .with_sinks(Arc::new(sinks)),
    );
    let spec = CommandSpec::new(vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo ${Env.GREETING}; echo oops >&2".to_string(),
    ]);

    let runner = Arc::clone(&supervisor);
    let handle = tokio::spawn(async move { runner.supervise("agent", &spec).await });

    let out_log = dir.path().join("agent.out.log");
    let restarted = wait_for(Duration::from_secs(10), Duration::from_millis(20), || async {
        log_lines(&out_log) >= 3
    })
    .await;
    assert!(restarted);

    supervisor.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let out = std::fs::read_to_string(&out_log).unwrap();
    assert!(out.lines().all(|line| line == "hello"));
    let err = std::fs::read_to_string(dir.path().join("agent.err.log")).unwrap();
    assert!(err.lines().count() >= 3);
    assert!(err.lines().all(|line| line == "oops"));
    assert!(supervisor.manager().is_empty());
}
