//! Pipeline configurations used across tests.

use drover_core::pipeline::{JobConfig, PipelineConfig, StageConfig};

/// Factory for test pipelines.
pub struct PipelineFixture;

impl PipelineFixture {
    /// One stage with one job running `tasks`.
    pub fn single(name: &str, tasks: &[&str]) -> PipelineConfig {
        let job = tasks
            .iter()
            .fold(JobConfig::new("run"), |job, task| job.with_task(*task));
        PipelineConfig::new(name).with_stage(StageConfig::new("build").with_job(job))
    }

    /// `build` then `test`, one passing job each.
    pub fn two_stage(name: &str) -> PipelineConfig {
        PipelineConfig::new(name)
            .with_stage(StageConfig::new("build").with_job(JobConfig::new("compile").with_task("true")))
            .with_stage(StageConfig::new("test").with_job(JobConfig::new("unit").with_task("true")))
    }

    /// One stage with `count` parallel passing jobs.
    pub fn fan_out(name: &str, count: usize) -> PipelineConfig {
        let stage = (0..count).fold(StageConfig::new("build"), |stage, i| {
            stage.with_job(JobConfig::new(format!("job-{i}")).with_task("true"))
        });
        PipelineConfig::new(name).with_stage(stage)
    }

    /// `upstream` -> `downstream`, both single passing jobs.
    pub fn chain(upstream: &str, downstream: &str) -> Vec<PipelineConfig> {
        vec![
            Self::single(upstream, &["true"]),
            Self::single(downstream, &["true"]).depends_on(upstream),
        ]
    }
}
