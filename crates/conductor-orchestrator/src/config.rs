use crate::types::AgentProfile;
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative weights of the two scoring components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight of the context score.
    #[serde(default = "default_context_weight")]
    pub context: f64,
    /// Weight of the keyword score.
    #[serde(default = "default_keyword_weight")]
    pub keyword: f64,
}

fn default_context_weight() -> f64 {
    0.8
}

fn default_keyword_weight() -> f64 {
    0.2
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            context: default_context_weight(),
            keyword: default_keyword_weight(),
        }
    }
}

impl ScoringWeights {
    /// Weights must be finite, non-negative and sum to 1.
    pub fn validate(&self) -> ConductorResult<()> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.context) || !valid(self.keyword) {
            return Err(ConductorError::Config(format!(
                "scoring weights must be finite and non-negative (context={}, keyword={})",
                self.context, self.keyword
            )));
        }
        if ((self.context + self.keyword) - 1.0).abs() > 1e-6 {
            return Err(ConductorError::Config(format!(
                "scoring weights must sum to 1.0, got {}",
                self.context + self.keyword
            )));
        }
        Ok(())
    }
}

/// Tunables for selection, admission, execution, health and handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on agents per selection.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Agents must score strictly above this to be selected.
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    /// Agent used when nothing clears the floor.
    #[serde(default = "default_fallback_agent")]
    pub fallback_agent: String,
    /// Scoring weights.
    #[serde(default)]
    pub weights: ScoringWeights,
    /// Maximum number of tasks running at once.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Maximum number of tasks waiting for capacity.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Timeout given to tasks built from a selection.
    #[serde(default = "default_per_task_timeout_seconds")]
    pub per_task_timeout_seconds: u64,
    /// How long a timed-out task may take to observe its cancellation.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// CPU budget shared by running tasks.
    #[serde(default = "default_cpu_threshold_percent")]
    pub cpu_threshold_percent: f64,
    /// Memory budget shared by running tasks.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,
    /// Fraction of the memory threshold that raises the cleanup signal.
    #[serde(default = "default_cleanup_trigger")]
    pub cleanup_trigger: f64,
    /// Token ratio at which compaction is suggested.
    #[serde(default = "default_token_suggest_compact")]
    pub token_suggest_compact: f64,
    /// Token ratio at which compaction is required.
    #[serde(default = "default_token_require_compact")]
    pub token_require_compact: f64,
    /// Minimum retention score for a committed handoff.
    #[serde(default = "default_retention_threshold")]
    pub retention_threshold: f64,
}

fn default_max_agents() -> usize {
    5
}
fn default_score_floor() -> f64 {
    0.1
}
fn default_fallback_agent() -> String {
    "master-orchestrator".to_string()
}
fn default_concurrency_limit() -> usize {
    5
}
fn default_queue_size() -> usize {
    20
}
fn default_per_task_timeout_seconds() -> u64 {
    300
}
fn default_cancel_grace_ms() -> u64 {
    1_000
}
fn default_cpu_threshold_percent() -> f64 {
    80.0
}
fn default_memory_threshold_mb() -> u64 {
    4_096
}
fn default_cleanup_trigger() -> f64 {
    0.88
}
fn default_token_suggest_compact() -> f64 {
    0.8
}
fn default_token_require_compact() -> f64 {
    0.9
}
fn default_retention_threshold() -> f64 {
    0.7
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            score_floor: default_score_floor(),
            fallback_agent: default_fallback_agent(),
            weights: ScoringWeights::default(),
            concurrency_limit: default_concurrency_limit(),
            queue_size: default_queue_size(),
            per_task_timeout_seconds: default_per_task_timeout_seconds(),
            cancel_grace_ms: default_cancel_grace_ms(),
            cpu_threshold_percent: default_cpu_threshold_percent(),
            memory_threshold_mb: default_memory_threshold_mb(),
            cleanup_trigger: default_cleanup_trigger(),
            token_suggest_compact: default_token_suggest_compact(),
            token_require_compact: default_token_require_compact(),
            retention_threshold: default_retention_threshold(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject values the components cannot work with.
    pub fn validate(&self) -> ConductorResult<()> {
        self.weights.validate()?;

        if self.max_agents == 0 {
            return Err(ConductorError::Config("max_agents must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.score_floor) {
            return Err(ConductorError::Config(format!(
                "score_floor must be within [0, 1], got {}",
                self.score_floor
            )));
        }
        if self.fallback_agent.trim().is_empty() {
            return Err(ConductorError::Config("fallback_agent cannot be empty".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(ConductorError::Config(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.per_task_timeout_seconds == 0 {
            return Err(ConductorError::Config(
                "per_task_timeout_seconds must be at least 1".into(),
            ));
        }
        if !(self.cpu_threshold_percent > 0.0 && self.cpu_threshold_percent.is_finite()) {
            return Err(ConductorError::Config(format!(
                "cpu_threshold_percent must be positive, got {}",
                self.cpu_threshold_percent
            )));
        }
        if self.memory_threshold_mb == 0 {
            return Err(ConductorError::Config(
                "memory_threshold_mb must be positive".into(),
            ));
        }
        if !(self.cleanup_trigger > 0.0 && self.cleanup_trigger <= 1.0) {
            return Err(ConductorError::Config(format!(
                "cleanup_trigger must be within (0, 1], got {}",
                self.cleanup_trigger
            )));
        }
        if !(0.0 < self.token_suggest_compact
            && self.token_suggest_compact < self.token_require_compact
            && self.token_require_compact <= 1.0)
        {
            return Err(ConductorError::Config(format!(
                "token thresholds must satisfy 0 < suggest < require <= 1 (suggest={}, require={})",
                self.token_suggest_compact, self.token_require_compact
            )));
        }
        if !(0.0..=1.0).contains(&self.retention_threshold) {
            return Err(ConductorError::Config(format!(
                "retention_threshold must be within [0, 1], got {}",
                self.retention_threshold
            )));
        }
        Ok(())
    }
}

/// Contents of a `conductor.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Orchestrator tunables.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Agent profiles; the built-in set is used when empty.
    #[serde(default)]
    pub profiles: Vec<AgentProfile>,
    /// Declared agent dependencies (`agent = ["agent it depends on", ...]`).
    /// The built-in rules are used when empty.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl ConductorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> ConductorResult<Self> {
        let config: ConductorConfig = toml::from_str(input)
            .map_err(|e| ConductorError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the orchestrator settings and every declared profile.
    pub fn validate(&self) -> ConductorResult<()> {
        self.orchestrator.validate()?;
        for profile in &self.profiles {
            profile.validate()?;
        }
        Ok(())
    }
}
