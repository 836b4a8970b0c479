use crate::config::OrchestratorConfig;
use crate::types::ConversationState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token ratio at which compaction is suggested.
pub const SUGGEST_COMPACT_RATIO: f64 = 0.8;

/// Token ratio at which compaction is required.
pub const REQUIRE_COMPACT_RATIO: f64 = 0.9;

/// Turn depth at which compaction is suggested.
pub const SUGGEST_COMPACT_DEPTH: u32 = 20;

/// Turn depth at which compaction is required.
pub const REQUIRE_COMPACT_DEPTH: u32 = 25;

const DEEP_CONVERSATION_DEPTH: u32 = 15;
const HIGH_COMPLEXITY: f64 = 0.8;

/// Conversation health signal, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Plenty of room left.
    Continue,
    /// Compaction is advisable soon.
    CompactSuggested,
    /// Compact before the next turn.
    CompactRequired,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Continue => write!(f, "continue"),
            HealthStatus::CompactSuggested => write!(f, "compact_suggested"),
            HealthStatus::CompactRequired => write!(f, "compact_required"),
        }
    }
}

/// Health from token usage alone, with the default thresholds.
///
/// A zero limit leaves no room at all and is always `CompactRequired`.
pub fn evaluate(tokens_used: u64, token_limit: u64) -> HealthStatus {
    evaluate_with(
        tokens_used,
        token_limit,
        SUGGEST_COMPACT_RATIO,
        REQUIRE_COMPACT_RATIO,
    )
}

/// Health from token usage with explicit ratio thresholds.
pub fn evaluate_with(tokens_used: u64, token_limit: u64, suggest: f64, require: f64) -> HealthStatus {
    if token_limit == 0 {
        return HealthStatus::CompactRequired;
    }
    let ratio = tokens_used as f64 / token_limit as f64;
    if ratio >= require {
        HealthStatus::CompactRequired
    } else if ratio >= suggest {
        HealthStatus::CompactSuggested
    } else {
        HealthStatus::Continue
    }
}

/// Full assessment of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Assessed conversation.
    pub conversation_id: Uuid,
    /// Worst of token and depth health.
    pub status: HealthStatus,
    /// Tokens used over the token limit.
    pub token_ratio: f64,
    /// Turns so far.
    pub turn_depth: u32,
    /// Human-readable suggestions, possibly empty.
    pub recommendations: Vec<String>,
}

/// Assesses conversations against token and depth thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMonitor {
    suggest_ratio: f64,
    require_ratio: f64,
    suggest_depth: u32,
    require_depth: u32,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(SUGGEST_COMPACT_RATIO, REQUIRE_COMPACT_RATIO)
    }
}

impl HealthMonitor {
    /// Create a new monitor with the given ratio thresholds and default depth thresholds.
    pub fn new(suggest_ratio: f64, require_ratio: f64) -> Self {
        Self {
            suggest_ratio,
            require_ratio,
            suggest_depth: SUGGEST_COMPACT_DEPTH,
            require_depth: REQUIRE_COMPACT_DEPTH,
        }
    }

    /// Create a new monitor with the configured ratio thresholds.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.token_suggest_compact, config.token_require_compact)
    }

    /// Override the turn-depth thresholds.
    pub fn with_depth_thresholds(mut self, suggest: u32, require: u32) -> Self {
        self.suggest_depth = suggest;
        self.require_depth = require;
        self
    }

    /// Token-only health with this monitor's thresholds.
    pub fn evaluate(&self, tokens_used: u64, token_limit: u64) -> HealthStatus {
        evaluate_with(tokens_used, token_limit, self.suggest_ratio, self.require_ratio)
    }

    /// Worst of token health and depth health, plus recommendations.
    pub fn assess(&self, state: &ConversationState) -> HealthReport {
        let by_tokens = self.evaluate(state.tokens_used, state.token_limit);
        let by_depth = if state.turn_depth >= self.require_depth {
            HealthStatus::CompactRequired
        } else if state.turn_depth >= self.suggest_depth {
            HealthStatus::CompactSuggested
        } else {
            HealthStatus::Continue
        };
        let status = by_tokens.max(by_depth);

        let mut recommendations = Vec::new();
        match status {
            HealthStatus::CompactRequired => {
                recommendations.push("Compact or hand off now, the conversation is at its limit".to_string())
            }
            HealthStatus::CompactSuggested => {
                recommendations.push("Prepare a handoff summary before the next phase".to_string())
            }
            HealthStatus::Continue => {}
        }
        if by_tokens >= HealthStatus::CompactSuggested {
            recommendations.push("High token usage, compact the history if possible".to_string());
        }
        if state.turn_depth > DEEP_CONVERSATION_DEPTH {
            recommendations.push("Deep conversation, consider a phase transition".to_string());
        }
        if state.complexity_score > HIGH_COMPLEXITY {
            recommendations.push("High context complexity, consider splitting the work".to_string());
        }

        HealthReport {
            conversation_id: state.conversation_id,
            status,
            token_ratio: state.token_ratio(),
            turn_depth: state.turn_depth,
            recommendations,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_thresholds() {
        assert_eq!(evaluate(8_500, 10_000), HealthStatus::CompactSuggested);
        assert_eq!(evaluate(9_000, 10_000), HealthStatus::CompactRequired);
        assert_eq!(evaluate(5_000, 10_000), HealthStatus::Continue);
        assert_eq!(evaluate(8_000, 10_000), HealthStatus::CompactSuggested);
        assert_eq!(evaluate(12_000, 10_000), HealthStatus::CompactRequired);
    }

    #[test]
    fn test_zero_limit_requires_compaction() {
        assert_eq!(evaluate(0, 0), HealthStatus::CompactRequired);
    }

    #[test]
    fn test_depth_escalates_status() {
        let monitor = HealthMonitor::default();
        let mut state = ConversationState::new(100_000);
        for _ in 0..20 {
            state.record_turn(100);
        }
        let report = monitor.assess(&state);
        assert_eq!(report.status, HealthStatus::CompactSuggested);

        for _ in 0..5 {
            state.record_turn(100);
        }
        assert_eq!(monitor.assess(&state).status, HealthStatus::CompactRequired);
    }

    #[test]
    fn test_healthy_conversation_has_no_recommendations() {
        let mut state = ConversationState::new(10_000);
        state.record_turn(1_000);
        let report = HealthMonitor::default().assess(&state);
        assert_eq!(report.status, HealthStatus::Continue);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_custom_thresholds() {
        let monitor = HealthMonitor::new(0.5, 0.6);
        assert_eq!(monitor.evaluate(5_500, 10_000), HealthStatus::CompactSuggested);
        assert_eq!(monitor.evaluate(6_000, 10_000), HealthStatus::CompactRequired);
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::CompactRequired > HealthStatus::CompactSuggested);
        assert!(HealthStatus::CompactSuggested > HealthStatus::Continue);
    }
}
