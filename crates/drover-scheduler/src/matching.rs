//! Agent matching for job assignment.

use drover_core::agent::Agent;
use drover_core::job::JobRequirements;

/// Decides whether an agent may run a job.
///
/// Among the jobs an agent matches, the dispatcher always offers the
/// oldest-scheduled one; the matcher only filters.
pub trait JobMatcher: Send + Sync {
    fn matches(&self, agent: &Agent, requirements: &JobRequirements) -> bool;
}

/// Default policy: pinned jobs only match their agent, environments must
/// line up, and required resources must be a subset of the agent's
/// resources (case-insensitive).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMatcher;

impl ResourceMatcher {
    pub fn new() -> Self {
        Self
    }

    fn matches_resources(&self, agent: &Agent, required: &[String]) -> bool {
        required.iter().all(|resource| {
            agent
                .resources
                .iter()
                .any(|have| have.eq_ignore_ascii_case(resource))
        })
    }

    /// An agent in environments only runs jobs of those environments; an
    /// agent in none only runs jobs outside any environment.
    fn matches_environment(&self, agent: &Agent, environment: Option<&str>) -> bool {
        match environment {
            Some(env) => agent
                .environments
                .iter()
                .any(|have| have.eq_ignore_ascii_case(env)),
            None => agent.environments.is_empty(),
        }
    }
}

impl JobMatcher for ResourceMatcher {
    fn matches(&self, agent: &Agent, requirements: &JobRequirements) -> bool {
        if let Some(pinned) = requirements.run_on_agent
            && pinned != agent.id
        {
            return false;
        }

        self.matches_environment(agent, requirements.environment.as_deref())
            && self.matches_resources(agent, &requirements.resources)
    }
}

impl<F> JobMatcher for F
where
    F: Fn(&Agent, &JobRequirements) -> bool + Send + Sync,
{
    fn matches(&self, agent: &Agent, requirements: &JobRequirements) -> bool {
        self(agent, requirements)
    }
}
