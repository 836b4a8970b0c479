use crate::config::ScoringWeights;
use crate::types::{AgentId, AgentProfile, Request};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Number of matching tags that yields a full keyword score.
const KEYWORD_SATURATION: f64 = 3.0;

/// Tokens of history one turn is assumed to contribute.
const TOKENS_PER_TURN: f64 = 500.0;

/// Tag count at which an agent counts as fully broad.
const BREADTH_SATURATION: f64 = 8.0;

/// Wildcard tag: the agent is aligned with every phase.
pub const ANY_PHASE: &str = "*";

/// Words that mark each development phase. Earlier phases win ties.
pub const PHASE_KEYWORDS: [(&str, &[&str]); 7] = [
    ("planning", &["plan", "planning", "design", "architect", "strategy", "requirement"]),
    ("design", &["design", "model", "schema", "structure", "pattern", "diagram"]),
    ("implementation", &["implement", "code", "build", "develop", "create", "write"]),
    ("testing", &["test", "testing", "verify", "validate", "debug", "fix"]),
    ("deployment", &["deploy", "release", "publish", "launch", "production"]),
    ("optimization", &["optimize", "improve", "performance", "speed", "efficiency"]),
    ("maintenance", &["maintain", "update", "refactor", "cleanup", "monitor"]),
];

/// Phase whose keywords occur most often in `text`, counting repeats.
/// `None` when no keyword occurs.
pub fn infer_phase(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut best: Option<(&'static str, usize)> = None;
    for (phase, keywords) in PHASE_KEYWORDS {
        let hits = words.iter().filter(|w| keywords.contains(*w)).count();
        match best {
            _ if hits == 0 => {}
            Some((_, top)) if top >= hits => {}
            _ => best = Some((phase, hits)),
        }
    }
    best.map(|(phase, _)| phase)
}

/// Phase used to score `request`: the declared one, else the inferred one.
pub fn resolve_phase(request: &Request) -> Option<String> {
    match request.context.phase.as_deref().map(str::trim) {
        Some(phase) if !phase.is_empty() => Some(phase.to_string()),
        _ => infer_phase(&request.text).map(str::to_string),
    }
}

/// Source of the context component of an agent's score.
///
/// Implementations may call out to other services and therefore may fail;
/// the selector degrades to keyword-only scoring when they do.
pub trait ContextAnalyzer: Send + Sync {
    /// Context fit of `profile` for `request`, in [0, 1].
    fn context_score(&self, request: &Request, profile: &AgentProfile) -> ConductorResult<f64>;
}

/// Default analyzer: phase alignment scaled by history-depth and complexity fit.
///
/// Without a declared phase the phase is inferred from the request text; an
/// inferred phase only lifts aligned agents and leaves the others neutral.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseContextAnalyzer;

impl ContextAnalyzer for PhaseContextAnalyzer {
    fn context_score(&self, request: &Request, profile: &AgentProfile) -> ConductorResult<f64> {
        let ctx = &request.context;
        let aligned = |phase: &str| profile.has_capability(phase) || profile.has_capability(ANY_PHASE);

        let phase_alignment = match ctx.phase.as_deref().map(str::trim) {
            Some(phase) if !phase.is_empty() => {
                if aligned(phase) {
                    1.0
                } else {
                    0.0
                }
            }
            _ => match infer_phase(&request.text) {
                Some(phase) if aligned(phase) => 1.0,
                _ => 0.5,
            },
        };

        let depth_fit = if ctx.history_depth == 0 {
            1.0
        } else {
            let needed = f64::from(ctx.history_depth) * TOKENS_PER_TURN;
            (profile.max_input_tokens as f64 / needed).min(1.0)
        };

        let complexity = ctx.complexity_estimate.clamp(0.0, 1.0);
        let breadth = (profile.capability_tags.len() as f64 / BREADTH_SATURATION).min(1.0);
        let complexity_fit = 1.0 - (complexity - breadth).abs();

        Ok(phase_alignment * (0.5 + 0.25 * depth_fit + 0.25 * complexity_fit))
    }
}

/// Lower-cased words of `text`. `+ # . -` are kept inside words so that
/// "c++", "c#" and "next.js" survive.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '+' | '#' | '.' | '-')))
        .map(|t| t.trim_matches(|c: char| c == '.' || c == '-'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fraction of saturation reached by tags that equal, or prefix, a word of the text.
pub fn keyword_score(text: &str, tags: &BTreeSet<String>) -> f64 {
    if tags.is_empty() {
        return 0.0;
    }
    let tokens = tokenize(text);
    let matches = tags
        .iter()
        .filter(|tag| tokens.iter().any(|tok| tok.starts_with(tag.as_str())))
        .count();
    (matches as f64 / KEYWORD_SATURATION).min(1.0)
}

/// Score of one agent for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentScore {
    /// Scored agent.
    pub agent_id: AgentId,
    /// Weighted total.
    pub score: f64,
    /// `None` when the score was computed keyword-only.
    pub context_score: Option<f64>,
    /// Keyword component in [0, 1].
    pub keyword_score: f64,
}

/// Combines context and keyword scores with configured weights.
#[derive(Clone)]
pub struct CapabilityScorer {
    weights: ScoringWeights,
    analyzer: Arc<dyn ContextAnalyzer>,
}

impl CapabilityScorer {
    /// Fails with a configuration error when the weights are invalid.
    pub fn new(weights: ScoringWeights, analyzer: Arc<dyn ContextAnalyzer>) -> ConductorResult<Self> {
        weights.validate()?;
        Ok(Self { weights, analyzer })
    }

    /// Get the configured weights.
    pub fn weights(&self) -> ScoringWeights {
        self.weights
    }

    /// Weighted score. Errors only when the context analyzer fails.
    pub fn score(&self, request: &Request, profile: &AgentProfile) -> ConductorResult<AgentScore> {
        let context = self.analyzer.context_score(request, profile)?;
        if !context.is_finite() {
            return Err(ConductorError::ContextAnalysis(format!(
                "non-finite context score for agent '{}'",
                profile.id
            )));
        }
        let context = context.clamp(0.0, 1.0);
        let keyword = keyword_score(&request.text, &profile.capability_tags);

        Ok(AgentScore {
            agent_id: profile.id.clone(),
            score: self.weights.context * context + self.weights.keyword * keyword,
            context_score: Some(context),
            keyword_score: keyword,
        })
    }

    /// Keyword score alone, used when context analysis is unavailable.
    pub fn keyword_only(&self, request: &Request, profile: &AgentProfile) -> AgentScore {
        let keyword = keyword_score(&request.text, &profile.capability_tags);
        AgentScore {
            agent_id: profile.id.clone(),
            score: keyword,
            context_score: None,
            keyword_score: keyword,
        }
    }
}

impl std::fmt::Debug for CapabilityScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityScorer")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}
