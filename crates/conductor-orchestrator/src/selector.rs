use crate::config::OrchestratorConfig;
use crate::mentions::MentionParser;
use crate::profiles::DependencyRules;
use crate::scorer::{
    resolve_phase, AgentScore, CapabilityScorer, ContextAnalyzer, PhaseContextAnalyzer,
};
use crate::types::{AgentId, AgentProfile, AgentTask, Request};
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ranked agents chosen for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Mentioned agents first, in mention order. The rest highest score
    /// first, ties ordered by ascending agent id.
    pub agents: Vec<AgentScore>,
    /// Context analysis failed and scores are keyword-only.
    pub degraded: bool,
    /// No agent cleared the floor; `agents` holds only the fallback agent.
    pub fallback: bool,
    /// Declared or inferred phase the agents were scored against.
    #[serde(default)]
    pub phase: Option<String>,
    /// Agents named with `@agent-<name>` in the request, in mention order.
    #[serde(default)]
    pub mentioned: Vec<AgentId>,
}

impl Selection {
    /// Ids of the selected agents, in rank order.
    pub fn agent_ids(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.agent_id.as_str()).collect()
    }

    /// One task per selected agent, using the agent id as task id.
    ///
    /// Dependencies come from `rules` and are kept only between selected
    /// agents. Higher-ranked agents get higher priority.
    pub fn into_tasks(
        &self,
        payload: &serde_json::Value,
        rules: &DependencyRules,
        timeout_seconds: u64,
    ) -> Vec<AgentTask> {
        let selected: BTreeSet<&str> = self.agents.iter().map(|a| a.agent_id.as_str()).collect();
        let count = self.agents.len();

        self.agents
            .iter()
            .enumerate()
            .map(|(rank, agent)| {
                let deps: Vec<&AgentId> = rules
                    .dependencies_of(&agent.agent_id)
                    .filter(|dep| selected.contains(dep.as_str()))
                    .collect();
                AgentTask::new(agent.agent_id.clone(), agent.agent_id.clone())
                    .with_payload(payload.clone())
                    .with_dependencies(deps.into_iter().cloned())
                    .with_priority((count - rank) as i32)
                    .with_timeout(timeout_seconds)
            })
            .collect()
    }
}

/// Ranks agent profiles against a request and returns a bounded set.
#[derive(Debug, Clone)]
pub struct AgentSelector {
    scorer: CapabilityScorer,
    mentions: MentionParser,
    floor: f64,
    fallback_agent: AgentId,
}

impl AgentSelector {
    /// Create a new selector.
    pub fn new(
        scorer: CapabilityScorer,
        floor: f64,
        fallback_agent: impl Into<String>,
    ) -> ConductorResult<Self> {
        Ok(Self {
            scorer,
            mentions: MentionParser::new()?,
            floor,
            fallback_agent: fallback_agent.into(),
        })
    }

    /// Selector with the default [`PhaseContextAnalyzer`].
    pub fn from_config(config: &OrchestratorConfig) -> ConductorResult<Self> {
        Self::with_analyzer(config, Arc::new(PhaseContextAnalyzer))
    }

    /// Selector scoring context with `analyzer`.
    pub fn with_analyzer(
        config: &OrchestratorConfig,
        analyzer: Arc<dyn ContextAnalyzer>,
    ) -> ConductorResult<Self> {
        let scorer = CapabilityScorer::new(config.weights, analyzer)?;
        Self::new(scorer, config.score_floor, config.fallback_agent.clone())
    }

    /// Agent used when nothing clears the floor.
    pub fn fallback_agent(&self) -> &str {
        &self.fallback_agent
    }

    /// Select at most `max_agents` agents scoring above the floor.
    ///
    /// Agents mentioned with `@agent-<name>` are always selected, ahead of
    /// the scored ones and regardless of the floor. Deterministic for
    /// identical inputs. A `max_agents` of 0 is treated as 1.
    pub fn select<'a>(
        &self,
        request: &Request,
        profiles: impl IntoIterator<Item = &'a AgentProfile>,
        max_agents: usize,
    ) -> Selection {
        let profiles: Vec<&AgentProfile> = profiles.into_iter().collect();
        let max_agents = max_agents.max(1);
        let phase = resolve_phase(request);
        let mentioned = self.mentions.resolve(&request.text, &profiles);

        let (mut scores, degraded) = match self.score_all(request, &profiles) {
            Ok(scores) => (scores, false),
            Err(e) => {
                warn!(
                    error = %e,
                    "Context analysis unavailable, degrading to keyword-only scoring"
                );
                let scores = profiles
                    .iter()
                    .map(|p| self.scorer.keyword_only(request, p))
                    .collect();
                (scores, true)
            }
        };

        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let fallback_score = scores
            .iter()
            .find(|s| s.agent_id == self.fallback_agent)
            .cloned();

        let (pinned, ranked): (Vec<AgentScore>, Vec<AgentScore>) = scores
            .into_iter()
            .partition(|s| mentioned.contains(&s.agent_id));
        let mut selected: Vec<AgentScore> = mentioned
            .iter()
            .filter_map(|id| pinned.iter().find(|s| &s.agent_id == id).cloned())
            .take(max_agents)
            .collect();
        let room = max_agents - selected.len();
        selected.extend(
            ranked
                .into_iter()
                .filter(|s| s.score > self.floor)
                .take(room),
        );

        if selected.is_empty() {
            info!(
                fallback = %self.fallback_agent,
                degraded,
                "No agent cleared the score floor, using fallback agent"
            );
            let fallback = fallback_score.unwrap_or_else(|| AgentScore {
                agent_id: self.fallback_agent.clone(),
                score: 0.0,
                context_score: None,
                keyword_score: 0.0,
            });
            return Selection {
                agents: vec![fallback],
                degraded,
                fallback: true,
                phase,
                mentioned,
            };
        }

        info!(
            selected = selected.len(),
            top = %selected[0].agent_id,
            mentioned = mentioned.len(),
            phase = phase.as_deref().unwrap_or("-"),
            degraded,
            "Agent selection complete"
        );

        Selection {
            agents: selected,
            degraded,
            fallback: false,
            phase,
            mentioned,
        }
    }

    fn score_all(
        &self,
        request: &Request,
        profiles: &[&AgentProfile],
    ) -> ConductorResult<Vec<AgentScore>> {
        profiles
            .iter()
            .map(|p| {
                let score = self.scorer.score(request, p)?;
                debug!(agent = %p.id, score = score.score, "Scored agent");
                Ok(score)
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::profiles::{default_dependency_rules, default_profiles};
    use conductor_core::ConductorError;

    fn selector() -> AgentSelector {
        AgentSelector::from_config(&OrchestratorConfig::default()).unwrap()
    }

    #[test]
    fn test_select_ranks_relevant_agents_first() {
        let profiles = default_profiles();
        let request = Request::new("Build a REST api backend service in rust with a sql schema")
            .with_phase("implementation");
        let selection = selector().select(&request, &profiles, 5);

        assert!(!selection.fallback);
        assert!(!selection.degraded);
        assert_eq!(selection.agents[0].agent_id, "backend-services");
        assert!(selection.agents.len() <= 5);
        for pair in selection.agents.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_select_is_deterministic() {
        let profiles = default_profiles();
        let request = Request::new("design the database schema and frontend components")
            .with_phase("design")
            .with_complexity(0.6);
        let first = selector().select(&request, &profiles, 3);
        for _ in 0..10 {
            assert_eq!(selector().select(&request, &profiles, 3), first);
        }
    }

    #[test]
    fn test_ties_broken_by_agent_id() {
        let profiles = vec![
            AgentProfile::new("zulu", ["api"]),
            AgentProfile::new("alpha", ["api"]),
            AgentProfile::new("mike", ["api"]),
        ];
        let selection = selector().select(&Request::new("api"), &profiles, 5);
        assert_eq!(selection.agent_ids(), vec!["alpha", "mike", "zulu"]);
    }

    #[test]
    fn test_max_agents_bounds_selection() {
        let profiles = default_profiles();
        let request = Request::new("anything");
        assert_eq!(selector().select(&request, &profiles, 2).agents.len(), 2);
        assert_eq!(selector().select(&request, &profiles, 0).agents.len(), 1);
    }

    #[test]
    fn test_fallback_when_nothing_clears_floor() {
        let profiles = default_profiles();
        let request = Request::new("water the plants").with_phase("gardening");
        let selection = selector().select(&request, &profiles, 5);
        assert!(selection.fallback);
        assert_eq!(selection.agent_ids(), vec!["master-orchestrator"]);
    }

    #[test]
    fn test_fallback_not_in_profiles() {
        let profiles = vec![AgentProfile::new("only", ["api"])];
        let request = Request::new("nothing relevant").with_phase("other");
        let selection = selector().select(&request, &profiles, 5);
        assert!(selection.fallback);
        assert_eq!(selection.agents[0].agent_id, "master-orchestrator");
        assert_eq!(selection.agents[0].score, 0.0);
    }

    struct BrokenAnalyzer;

    impl ContextAnalyzer for BrokenAnalyzer {
        fn context_score(&self, _: &Request, _: &AgentProfile) -> ConductorResult<f64> {
            Err(ConductorError::ContextAnalysis("upstream unavailable".into()))
        }
    }

    #[test]
    fn test_degrades_to_keyword_only() {
        let selector =
            AgentSelector::with_analyzer(&OrchestratorConfig::default(), Arc::new(BrokenAnalyzer))
                .unwrap();
        let profiles = default_profiles();
        let request = Request::new("write integration tests with coverage").with_phase("testing");
        let selection = selector.select(&request, &profiles, 5);

        assert!(selection.degraded);
        assert!(!selection.fallback);
        assert_eq!(selection.agents[0].agent_id, "testing-automation");
        assert!(selection.agents.iter().all(|a| a.context_score.is_none()));
    }

    #[test]
    fn test_mentioned_agents_pinned_ahead_of_floor() {
        let profiles = default_profiles();
        let request = Request::new("@agent-security please look at this, and @agent-deployment too")
            .with_phase("gardening");
        let selection = selector().select(&request, &profiles, 5);

        assert!(!selection.fallback);
        assert_eq!(selection.mentioned, vec!["security-architecture", "deployment"]);
        assert_eq!(
            &selection.agent_ids()[..2],
            &["security-architecture", "deployment"]
        );
        // Nothing else clears the floor for an unknown phase.
        assert_eq!(selection.agents.len(), 2);
    }

    #[test]
    fn test_mentions_respect_max_agents() {
        let profiles = default_profiles();
        let request =
            Request::new("@agent-deployment @agent-security backend api service in rust")
                .with_phase("implementation");
        let selection = selector().select(&request, &profiles, 2);
        assert_eq!(selection.agent_ids(), vec!["deployment", "security-architecture"]);

        let wider = selector().select(&request, &profiles, 3);
        assert_eq!(wider.agent_ids()[2], "backend-services");
    }

    #[test]
    fn test_phase_inferred_when_missing() {
        let profiles = default_profiles();
        let request = Request::new("deploy the release to kubernetes with docker");
        let selection = selector().select(&request, &profiles, 3);
        assert_eq!(selection.phase.as_deref(), Some("deployment"));
        assert_eq!(selection.agents[0].agent_id, "deployment");
    }

    #[test]
    fn test_into_tasks_keeps_edges_between_selected_agents() {
        let selection = Selection {
            agents: vec![
                AgentScore {
                    agent_id: "backend-services".into(),
                    score: 0.9,
                    context_score: Some(0.9),
                    keyword_score: 1.0,
                },
                AgentScore {
                    agent_id: "database-architecture".into(),
                    score: 0.7,
                    context_score: Some(0.7),
                    keyword_score: 0.6,
                },
            ],
            degraded: false,
            fallback: false,
            phase: Some("implementation".into()),
            mentioned: Vec::new(),
        };
        let tasks = selection.into_tasks(
            &serde_json::json!({"request": "build it"}),
            &default_dependency_rules(),
            120,
        );

        assert_eq!(tasks.len(), 2);
        let backend = tasks.iter().find(|t| t.id == "backend-services").unwrap();
        // technical-specifications is not selected, so only the database edge survives.
        assert_eq!(
            backend.depends_on.iter().collect::<Vec<_>>(),
            vec!["database-architecture"]
        );
        assert_eq!(backend.priority, 2);
        assert_eq!(backend.timeout_seconds, 120);
        let db = tasks.iter().find(|t| t.id == "database-architecture").unwrap();
        assert!(db.depends_on.is_empty());
    }
}
