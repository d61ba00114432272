//! Agent controller driving real jobs through the dispatcher.

use drover_core::agent::AgentRuntimeStatus;
use drover_core::ids::PipelineName;
use drover_core::job::{JobOutcome, JobResult, JobState};
use drover_core::pipeline::{JobConfig, PipelineConfig, StageConfig};
use drover_core::protocol::AgentProtocol;
use drover_core::work::{AgentInstruction, Work};
use drover_scheduler::lifecycle::RunStatus;
use drover_tests::{PipelineFixture, TestContext, assert_completes_within, wait_for};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn run_status(ctx: &TestContext, pipeline: &str) -> Option<RunStatus> {
    ctx.dispatcher
        .tracker()
        .latest_run(&PipelineName::new(pipeline))
        .map(|run| run.status)
}

#[tokio::test]
async fn test_two_stage_pipeline_passes() {
    let ctx = TestContext::new();
    ctx.load(vec![PipelineFixture::two_stage("app")]);
    let agent = ctx.agent(&[]);
    ctx.trigger("app").await;

    let first = agent.poll_work().await.unwrap();
    assert_eq!(first.assignment().unwrap().job.stage_name, "build");
    assert_eq!(run_status(&ctx, "app"), Some(RunStatus::Building));

    let second = agent.poll_work().await.unwrap();
    assert_eq!(second.assignment().unwrap().job.stage_name, "test");
    assert_eq!(run_status(&ctx, "app"), Some(RunStatus::Passed));

    assert!(matches!(agent.poll_work().await.unwrap(), Work::NoWork));
    assert_eq!(ctx.archive.len(), 2);
    assert_eq!(agent.status(), AgentRuntimeStatus::Idle);
    assert!(agent.current_job().is_none());
}

#[tokio::test]
async fn test_failing_task_fails_the_run() {
    let ctx = TestContext::new();
    ctx.load(vec![PipelineFixture::single("broken", &["true", "exit 3", "touch never"])]);
    let agent = ctx.agent(&[]);
    ctx.trigger("broken").await;

    let work = agent.poll_work().await.unwrap();
    assert!(work.is_build());
    assert_eq!(run_status(&ctx, "broken"), Some(RunStatus::Failed));
    assert!(
        ctx.dispatcher
            .tracker()
            .is_latest_stage_unsuccessful(&PipelineName::new("broken"), "build")
    );
    assert_eq!(ctx.archive.all()[0].state, JobState::Completed(JobOutcome::Failed));
}

#[tokio::test]
async fn test_upstream_success_triggers_downstream() {
    let ctx = TestContext::new();
    ctx.load(PipelineFixture::chain("lib", "service"));
    let agent = ctx.agent(&[]);
    ctx.trigger("lib").await;

    let upstream = agent.poll_work().await.unwrap();
    assert_eq!(upstream.assignment().unwrap().job.pipeline_name.as_str(), "lib");
    assert_eq!(run_status(&ctx, "service"), Some(RunStatus::Building));

    let downstream = agent.poll_work().await.unwrap();
    assert_eq!(downstream.assignment().unwrap().job.pipeline_name.as_str(), "service");
    assert_eq!(run_status(&ctx, "service"), Some(RunStatus::Passed));
}

#[tokio::test]
async fn test_resource_mismatch_gets_no_work() {
    let ctx = TestContext::new();
    let pipeline = PipelineConfig::new("gpu").with_stage(
        StageConfig::new("train").with_job(
            JobConfig::new("fit")
                .with_resource("cuda")
                .with_task("true"),
        ),
    );
    ctx.load(vec![pipeline]);
    let plain = ctx.agent(&["linux"]);
    let gpu = ctx.agent(&["linux", "cuda"]);
    ctx.trigger("gpu").await;

    assert!(matches!(plain.poll_work().await.unwrap(), Work::NoWork));
    assert!(gpu.poll_work().await.unwrap().is_build());
    assert_eq!(run_status(&ctx, "gpu"), Some(RunStatus::Passed));
}

#[tokio::test]
async fn test_cancelled_job_is_killed_on_next_ping() {
    let ctx = TestContext::new();
    ctx.load(vec![PipelineFixture::single("slow", &["sleep 30"])]);
    let agent = ctx.agent(&[]);
    ctx.trigger("slow").await;

    let controller = Arc::clone(&agent.controller);
    let running = tokio::spawn(async move { controller.poll_work().await });

    let started = wait_for(Duration::from_secs(5), Duration::from_millis(10), || async {
        agent.status() == AgentRuntimeStatus::Building && agent.current_job().is_some()
    })
    .await;
    assert!(started);

    let job = agent.current_job().unwrap();
    assert!(ctx.dispatcher.cancel_job(&job).await.unwrap());
    assert!(ctx.dispatcher.is_ignored(&agent.info(), &job).await.unwrap());
    assert_eq!(agent.ping().await.unwrap(), AgentInstruction::CancelJob);

    let work = assert_completes_within(running, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(work.assignment().unwrap().job, job);
    assert_eq!(agent.status(), AgentRuntimeStatus::Idle);
    assert_eq!(ctx.archive.len(), 1);
    assert_eq!(ctx.archive.all()[0].state, JobState::Cancelled);

    // Reporting idle clears the cancellation on the server.
    assert_eq!(agent.ping().await.unwrap(), AgentInstruction::None);
}

#[tokio::test]
async fn test_background_loops_run_until_shutdown() {
    let ctx = TestContext::new();
    ctx.load(vec![PipelineFixture::fan_out("wide", 3)]);
    let agent = ctx.agent(&[]);
    ctx.trigger("wide").await;

    let handle = agent.controller.start();
    let passed = wait_for(Duration::from_secs(15), Duration::from_millis(50), || async {
        run_status(&ctx, "wide") == Some(RunStatus::Passed)
    })
    .await;
    assert!(passed);

    agent.shutdown();
    assert_completes_within(handle, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(ctx.archive.len(), 3);
    assert!(ctx.dispatcher.registry().get(agent.id()).is_some());
}

#[tokio::test]
async fn test_completion_report_from_old_incarnation_is_ignored() {
    let ctx = TestContext::new();
    ctx.load(vec![PipelineFixture::single("api", &["true"])]);
    let stale = ctx.connect(&[]).await;
    ctx.trigger("api").await;
    let job = ctx
        .dispatcher
        .get_work(&stale)
        .await
        .unwrap()
        .assignment()
        .unwrap()
        .job
        .clone();

    // The agent process restarted and obtained a new cookie.
    let cookie = ctx.dispatcher.get_cookie(&stale).await.unwrap();
    let current = stale.clone().with_cookie(cookie);

    ctx.dispatcher
        .report_completed(&stale, &job, JobResult::Passed)
        .await
        .unwrap();
    assert!(ctx.archive.is_empty());

    ctx.dispatcher
        .report_completed(&current, &job, JobResult::Passed)
        .await
        .unwrap();
    assert_eq!(ctx.archive.len(), 1);
}
