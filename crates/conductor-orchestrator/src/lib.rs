//! Agent orchestration and scheduling core.
//!
//! Selects the specialized agents that should handle a request, turns them
//! into a dependency graph of tasks, runs the graph phase by phase under a
//! resource governor, and hands conversational context between agents.
//!
//! # Main types
//!
//! - [`Orchestrator`]: End-to-end select, plan, execute and persist pipeline.
//! - [`AgentSelector`]: Ranks agent profiles for a request.
//! - [`ParallelExecutor`]: Runs plan phases concurrently with timeouts and cancellation.
//! - [`ResourceGovernor`]: Admission control for concurrency, CPU and memory budgets.
//! - [`HandoffManager`]: Staged context transfer with retention scoring and rollback.
//! - [`HealthMonitor`]: Token and depth based conversation health.

/// Agent execution backends and the agent pool.
pub mod backend;
/// Configuration loaded from `conductor.toml`.
pub mod config;
/// End-to-end orchestration pipeline.
pub mod engine;
/// Phase execution with timeouts and dependency skipping.
pub mod executor;
/// Admission control.
pub mod governor;
/// Context handoff protocol.
pub mod handoff;
/// Conversation health thresholds.
pub mod health;
/// `@agent-<name>` mention parsing.
pub mod mentions;
/// Execution events and per-agent metrics.
pub mod monitor;
/// Dependency graph validation and phase layering.
pub mod planner;
/// Capability registry, built-in profiles and dependency rules.
pub mod profiles;
/// Capability scoring.
pub mod scorer;
/// Agent selection.
pub mod selector;
/// Result and handoff persistence.
pub mod store;
/// Shared orchestration types (AgentTask, ExecutionPlan, TaskResult, etc.).
pub mod types;

pub use backend::{echo_pool, Agent, AgentBackend, AgentPool, EchoAgent};
pub use config::{ConductorConfig, OrchestratorConfig, ScoringWeights};
pub use engine::{OrchestrationOutcome, Orchestrator};
pub use executor::{invocation_input, ParallelExecutor};
pub use governor::{Admission, GovernorLimits, GovernorSnapshot, ResourceGovernor};
pub use handoff::{HandoffContext, HandoffManager, HandoffResult, HandoffStage, HandoffStats};
pub use health::{evaluate, HealthMonitor, HealthReport, HealthStatus};
pub use mentions::MentionParser;
pub use monitor::{ExecutionMonitor, OrchestrationEvent, TaskState};
pub use planner::{build_plan, DependencyGraph};
pub use profiles::{
    default_dependency_rules, default_profiles, CapabilityRegistry, DependencyRules,
    ProfileRegistry,
};
pub use scorer::{
    infer_phase, resolve_phase, AgentScore, CapabilityScorer, ContextAnalyzer,
    PhaseContextAnalyzer,
};
pub use selector::{AgentSelector, Selection};
pub use store::{FileResultStore, MemoryResultStore, ResultStore};
pub use types::{
    AgentProfile, AgentTask, ConversationState, ExecutionPlan, ExecutionResult, HandoffOutcome,
    HandoffRecord, Request, RequestContext, ResourceCost, TaskResult, TaskStatus,
};
