//! Trigger matching: which pipelines a new fact about the world schedules.

use drover_core::PipelineName;
use drover_core::pipeline::{BuildCause, MaterialRevision, PipelineConfig};

/// External fact that can trigger pipelines.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// A material has a new revision, as observed by an SCM poller.
    MaterialChanged(MaterialRevision),
    /// Someone forced a pipeline to run.
    Manual {
        pipeline: PipelineName,
        approver: String,
    },
}

impl TriggerEvent {
    pub fn material_changed(material: impl Into<String>, revision: impl Into<String>) -> Self {
        TriggerEvent::MaterialChanged(MaterialRevision::new(material, revision))
    }

    pub fn build_cause(&self) -> BuildCause {
        match self {
            TriggerEvent::MaterialChanged(revision) => {
                BuildCause::from_revisions(vec![revision.clone()])
            }
            TriggerEvent::Manual { approver, .. } => BuildCause::forced_by(approver.clone()),
        }
    }
}

/// Matcher for determining which pipelines an event triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a pipeline should be triggered by an event.
    pub fn matches(&self, pipeline: &PipelineConfig, event: &TriggerEvent) -> bool {
        match event {
            TriggerEvent::MaterialChanged(revision) => pipeline
                .materials
                .iter()
                .any(|m| self.material_matches(m, &revision.material)),
            TriggerEvent::Manual { pipeline: name, .. } => &pipeline.name == name,
        }
    }

    /// Pipelines triggered by an event, in the order given.
    pub fn affected<'a>(
        &self,
        pipelines: impl IntoIterator<Item = &'a PipelineConfig>,
        event: &TriggerEvent,
    ) -> Vec<PipelineName> {
        pipelines
            .into_iter()
            .filter(|p| self.matches(p, event))
            .map(|p| p.name.clone())
            .collect()
    }

    fn material_matches(&self, configured: &str, observed: &str) -> bool {
        configured.trim_end_matches('/').eq_ignore_ascii_case(observed.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipelines() -> Vec<PipelineConfig> {
        vec![
            PipelineConfig::new("api").with_material("git@example.com:api.git"),
            PipelineConfig::new("web")
                .with_material("git@example.com:web.git")
                .with_material("git@example.com:api.git"),
            PipelineConfig::new("docs"),
        ]
    }

    #[test]
    fn test_material_change_matches_all_consumers() {
        let matcher = TriggerMatcher::new();
        let event = TriggerEvent::material_changed("git@example.com:api.git", "abc123");
        let affected = matcher.affected(&pipelines(), &event);
        assert_eq!(affected, vec![PipelineName::new("api"), PipelineName::new("web")]);
    }

    #[test]
    fn test_trailing_slash_is_ignored() {
        let matcher = TriggerMatcher::new();
        let event = TriggerEvent::material_changed("git@example.com:web.git/", "abc123");
        assert_eq!(matcher.affected(&pipelines(), &event), vec![PipelineName::new("web")]);
    }

    #[test]
    fn test_manual_trigger() {
        let matcher = TriggerMatcher::new();
        let event = TriggerEvent::Manual {
            pipeline: "DOCS".into(),
            approver: "alice".to_string(),
        };
        assert_eq!(matcher.affected(&pipelines(), &event), vec![PipelineName::new("docs")]);
        assert!(event.build_cause().forced);
    }
}
