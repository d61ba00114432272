//! Pipeline configuration types.
//!
//! A pipeline is an ordered list of stages, each a set of jobs, triggered by
//! new revisions of its materials or by the completion of upstream pipelines.

use crate::ids::{AgentId, PipelineName};
use crate::job::JobRequirements;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: PipelineName,
    /// Pipelines this one depends on, in declaration order.
    #[serde(default)]
    pub upstream: Vec<PipelineName>,
    /// Names of source materials whose new revisions trigger this pipeline.
    #[serde(default)]
    pub materials: Vec<String>,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub environment: Option<String>,
}

impl PipelineConfig {
    pub fn new(name: impl Into<PipelineName>) -> Self {
        Self {
            name: name.into(),
            upstream: vec![],
            materials: vec![],
            stages: vec![],
            environment: None,
        }
    }

    pub fn depends_on(mut self, upstream: impl Into<PipelineName>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn with_material(mut self, material: impl Into<String>) -> Self {
        self.materials.push(material.into());
        self
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn in_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage that follows `name`, if any.
    pub fn next_stage(&self, name: &str) -> Option<&StageConfig> {
        let idx = self.stages.iter().position(|s| s.name == name)?;
        self.stages.get(idx + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub jobs: Vec<JobConfig>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: vec![],
        }
    }

    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.jobs.push(job);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub run_on_agent: Option<AgentId>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: vec![],
            tasks: vec![],
            run_on_agent: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.tasks.push(task.into());
        self
    }

    pub fn pinned_to(mut self, agent: AgentId) -> Self {
        self.run_on_agent = Some(agent);
        self
    }

    pub fn requirements(&self, environment: Option<&str>) -> JobRequirements {
        JobRequirements {
            resources: self.resources.clone(),
            environment: environment.map(str::to_string),
            run_on_agent: self.run_on_agent,
        }
    }
}

/// One observed revision of a material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRevision {
    pub material: String,
    pub revision: String,
    pub modified_at: DateTime<Utc>,
}

impl MaterialRevision {
    pub fn new(material: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            material: material.into(),
            revision: revision.into(),
            modified_at: Utc::now(),
        }
    }

    /// Revision describing a passed upstream pipeline run.
    pub fn upstream(pipeline: &PipelineName, counter: u32, stage: &str, stage_counter: u32) -> Self {
        Self::new(
            format!("pipeline:{}", pipeline),
            format!("{}/{}/{}/{}", pipeline, counter, stage, stage_counter),
        )
    }
}

/// Why a pipeline instance was scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCause {
    pub revisions: Vec<MaterialRevision>,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub forced: bool,
}

impl BuildCause {
    pub fn from_revisions(revisions: Vec<MaterialRevision>) -> Self {
        Self {
            revisions,
            approver: None,
            forced: false,
        }
    }

    /// Manually triggered run.
    pub fn forced_by(approver: impl Into<String>) -> Self {
        Self {
            revisions: vec![],
            approver: Some(approver.into()),
            forced: true,
        }
    }
}
