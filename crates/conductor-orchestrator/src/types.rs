use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use uuid::Uuid;

/// Identifier of a task within a plan.
pub type TaskId = String;

/// Identifier of an agent in the capability registry.
pub type AgentId = String;

/// Default per-task timeout, in seconds.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Default input budget for an agent profile, in tokens.
pub const DEFAULT_MAX_INPUT_TOKENS: usize = 8_000;

/// Estimated resource footprint of one running agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCost {
    /// Share of one CPU, in percent.
    #[serde(default)]
    pub cpu_percent: f64,
    /// Resident memory, in megabytes.
    #[serde(default)]
    pub memory_mb: u64,
}

impl ResourceCost {
    /// Create a new cost estimate.
    pub fn new(cpu_percent: f64, memory_mb: u64) -> Self {
        Self {
            cpu_percent,
            memory_mb,
        }
    }

    /// A cost the governor can account: the CPU share is finite and not negative.
    pub fn is_valid(&self) -> bool {
        self.cpu_percent.is_finite() && self.cpu_percent >= 0.0
    }
}

/// Declared capabilities and budget of a specialized agent.
///
/// Profiles are loaded once with the configuration and never mutated; they
/// are shared read-only for the lifetime of every plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent id, also used as the task id when planning.
    pub id: AgentId,
    /// Human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Lower-cased capability tags.
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// Cost charged against the governor budget while the agent runs.
    #[serde(default)]
    pub estimated_resource_cost: ResourceCost,
    /// Input budget used by handoff context pruning.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    /// Named resources the agent must hold alone while it runs.
    #[serde(default)]
    pub exclusive_resources: BTreeSet<String>,
}

fn default_max_input_tokens() -> usize {
    DEFAULT_MAX_INPUT_TOKENS
}

impl AgentProfile {
    /// Create a new profile with the given capability tags.
    pub fn new<I, S>(id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            description: String::new(),
            capability_tags: tags.into_iter().map(|t| t.into().to_lowercase()).collect(),
            estimated_resource_cost: ResourceCost::default(),
            max_input_tokens: DEFAULT_MAX_INPUT_TOKENS,
            exclusive_resources: BTreeSet::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the estimated resource cost.
    pub fn with_cost(mut self, cpu_percent: f64, memory_mb: u64) -> Self {
        self.estimated_resource_cost = ResourceCost::new(cpu_percent, memory_mb);
        self
    }

    /// Set the input token budget.
    pub fn with_max_input_tokens(mut self, tokens: usize) -> Self {
        self.max_input_tokens = tokens;
        self
    }

    /// Set the named resources held exclusively while the agent runs.
    pub fn with_exclusive_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusive_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Reject profiles the scheduler cannot account for.
    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.id.trim().is_empty() {
            return Err(ConductorError::Config("agent profile id must not be empty".into()));
        }
        if !self.estimated_resource_cost.is_valid() {
            return Err(ConductorError::Config(format!(
                "agent '{}': cpu_percent must be finite and non-negative, got {}",
                self.id, self.estimated_resource_cost.cpu_percent
            )));
        }
        if self.max_input_tokens == 0 {
            return Err(ConductorError::Config(format!(
                "agent '{}': max_input_tokens must be > 0",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether the profile declares `tag`, ignoring case.
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capability_tags.contains(&tag.to_lowercase())
    }

    /// Required tags this profile does not declare, in sorted order.
    pub fn missing_capabilities<'a>(
        &self,
        required: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        required
            .into_iter()
            .filter(|tag| !self.has_capability(tag))
            .cloned()
            .collect()
    }
}

/// Conversation context attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Development phase the conversation is in (e.g. "design", "implementation").
    #[serde(default)]
    pub phase: Option<String>,
    /// Number of turns already in the conversation.
    #[serde(default)]
    pub history_depth: u32,
    /// Estimated complexity in [0, 1].
    #[serde(default)]
    pub complexity_estimate: f64,
}

/// A user turn to be routed to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Free-form request text.
    pub text: String,
    /// Conversation context.
    #[serde(default)]
    pub context: RequestContext,
}

impl Request {
    /// Create a new request with an empty context.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: RequestContext::default(),
        }
    }

    /// Set the development phase.
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.context.phase = Some(phase.into());
        self
    }

    /// Set the number of prior turns.
    pub fn with_history_depth(mut self, depth: u32) -> Self {
        self.context.history_depth = depth;
        self
    }

    /// Set the complexity estimate.
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.context.complexity_estimate = complexity;
        self
    }
}

/// One unit of scheduled work bound to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    /// Unique id within the plan.
    pub id: TaskId,
    /// Agent that runs the task.
    pub agent_id: AgentId,
    /// Payload passed to the agent under `input`.
    #[serde(default)]
    pub input_payload: serde_json::Value,
    /// Tasks that must succeed before this one starts.
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    /// Higher runs earlier within a phase.
    #[serde(default)]
    pub priority: i32,
    /// Wall-clock limit for one run. Must be greater than zero.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Named resources held alone while the task runs, in addition to
    /// those of its agent profile.
    #[serde(default)]
    pub exclusive_resources: BTreeSet<String>,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

impl AgentTask {
    /// Create a new task for `agent_id` with default timeout and no dependencies.
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            input_payload: serde_json::Value::Null,
            depends_on: BTreeSet::new(),
            priority: 0,
            timeout_seconds: DEFAULT_TASK_TIMEOUT_SECS,
            exclusive_resources: BTreeSet::new(),
        }
    }

    /// Set the input payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.input_payload = payload;
        self
    }

    /// Replace the dependency set.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the timeout, in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set the task-level exclusive resources.
    pub fn with_exclusive_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusive_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// True when every dependency is in `terminal`.
    pub fn is_ready(&self, terminal: &HashSet<TaskId>) -> bool {
        self.depends_on.iter().all(|dep| terminal.contains(dep))
    }
}

/// Phased execution plan. Phase `n` only depends on phases `< n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan id, echoed in results and events.
    pub id: Uuid,
    /// Tasks grouped by phase.
    pub phases: Vec<Vec<AgentTask>>,
    /// When the plan was built.
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Create a new plan with a fresh id.
    pub fn new(phases: Vec<Vec<AgentTask>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phases,
            created_at: Utc::now(),
        }
    }

    /// Number of phases.
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Number of tasks across all phases.
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// Iterate over all tasks in phase order.
    pub fn tasks(&self) -> impl Iterator<Item = &AgentTask> {
        self.phases.iter().flatten()
    }

    /// Index of the phase containing `task_id`.
    pub fn phase_of(&self, task_id: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.iter().any(|t| t.id == task_id))
    }
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The agent returned an output.
    Succeeded,
    /// The agent, the registry or the governor reported an error.
    Failed,
    /// The task ran past its timeout and was cancelled.
    TimedOut,
    /// Never started because a dependency did not succeed or the plan was cancelled.
    Skipped,
}

impl TaskStatus {
    /// Dependants of a task with this status are skipped.
    pub fn blocks_dependants(self) -> bool {
        !matches!(self, TaskStatus::Succeeded)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the task.
    pub task_id: TaskId,
    /// Agent the task was bound to.
    pub agent_id: AgentId,
    /// Phase index the task belonged to.
    pub phase: usize,
    /// Terminal status.
    pub status: TaskStatus,
    /// Agent output, present only on success.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    /// Error message or skip reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Category of the error, if any.
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock run time.
    pub duration_ms: u64,
    /// Cost that was charged while the task ran.
    #[serde(default)]
    pub resource_usage: ResourceCost,
}

impl TaskResult {
    /// Record a successful run.
    pub fn succeeded(
        task: &AgentTask,
        phase: usize,
        output: serde_json::Value,
        duration_ms: u64,
        usage: ResourceCost,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            phase,
            status: TaskStatus::Succeeded,
            output: Some(output),
            error: None,
            error_kind: None,
            duration_ms,
            resource_usage: usage,
        }
    }

    /// Record a task-level error. Timeouts map to [`TaskStatus::TimedOut`],
    /// everything else to [`TaskStatus::Failed`].
    pub fn from_error(
        task: &AgentTask,
        phase: usize,
        err: &ConductorError,
        duration_ms: u64,
        usage: ResourceCost,
    ) -> Self {
        let status = match err {
            ConductorError::TimedOut { .. } => TaskStatus::TimedOut,
            _ => TaskStatus::Failed,
        };
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            phase,
            status,
            output: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            duration_ms,
            resource_usage: usage,
        }
    }

    /// Record a task that never ran.
    pub fn skipped(task: &AgentTask, phase: usize, reason: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            phase,
            status: TaskStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            error_kind: None,
            duration_ms: 0,
            resource_usage: ResourceCost::default(),
        }
    }
}

/// Aggregate result of running a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Id of the executed plan.
    pub plan_id: Uuid,
    /// One result per task of the plan.
    pub tasks: BTreeMap<TaskId, TaskResult>,
    /// Count of succeeded tasks.
    pub succeeded: usize,
    /// Count of failed tasks.
    pub failed: usize,
    /// Count of timed-out tasks.
    pub timed_out: usize,
    /// Count of skipped tasks.
    pub skipped: usize,
    /// Wall-clock time of the whole plan.
    pub total_duration_ms: u64,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Build the aggregate from per-task results.
    pub fn from_results(
        plan_id: Uuid,
        tasks: BTreeMap<TaskId, TaskResult>,
        started_at: DateTime<Utc>,
        total_duration_ms: u64,
    ) -> Self {
        let count = |status: TaskStatus| tasks.values().filter(|r| r.status == status).count();
        Self {
            plan_id,
            succeeded: count(TaskStatus::Succeeded),
            failed: count(TaskStatus::Failed),
            timed_out: count(TaskStatus::TimedOut),
            skipped: count(TaskStatus::Skipped),
            tasks,
            total_duration_ms,
            started_at,
            completed_at: Utc::now(),
        }
    }

    /// Number of tasks in the plan.
    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Get the status of one task.
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|r| r.status)
    }

    /// True when every task succeeded.
    pub fn is_success(&self) -> bool {
        self.succeeded == self.tasks.len()
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Plan {}: {}/{} tasks succeeded, {} failed, {} timed out, {} skipped in {}ms",
            self.plan_id,
            self.succeeded,
            self.total_tasks(),
            self.failed,
            self.timed_out,
            self.skipped,
            self.total_duration_ms
        )
    }
}

/// Token budget and depth of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    /// Conversation id.
    pub conversation_id: Uuid,
    /// Tokens consumed so far.
    pub tokens_used: u64,
    /// Advisory token budget.
    pub token_limit: u64,
    /// Number of turns so far.
    pub turn_depth: u32,
    /// Estimated complexity in [0, 1].
    #[serde(default)]
    pub complexity_score: f64,
}

impl ConversationState {
    /// Create a new conversation with a fresh id.
    pub fn new(token_limit: u64) -> Self {
        Self {
            conversation_id: Uuid::new_v4(),
            tokens_used: 0,
            token_limit,
            turn_depth: 0,
            complexity_score: 0.0,
        }
    }

    /// Account for one more turn. The limit is advisory and not enforced.
    pub fn record_turn(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.turn_depth = self.turn_depth.saturating_add(1);
    }

    /// Fraction of the token budget used. Infinite when the limit is zero.
    pub fn token_ratio(&self) -> f64 {
        if self.token_limit == 0 {
            return f64::INFINITY;
        }
        self.tokens_used as f64 / self.token_limit as f64
    }
}

/// Terminal outcome of a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffOutcome {
    /// Context was delivered to the target agent.
    Committed,
    /// The handoff failed and nothing was delivered.
    RolledBack,
}

/// Append-only record of a finished handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRecord {
    /// Record id.
    pub id: Uuid,
    /// Conversation the handoff belongs to.
    pub conversation_id: Uuid,
    /// Agent handing off.
    pub source_agent_id: AgentId,
    /// Agent receiving the context.
    pub target_agent_id: AgentId,
    /// Context actually handed over. Empty for rolled-back handoffs.
    #[serde(default)]
    pub context_snapshot: serde_json::Map<String, serde_json::Value>,
    /// Retention score of the snapshot.
    pub retention_score: f64,
    /// Whether the handoff committed.
    pub outcome: HandoffOutcome,
    /// Failure reason for rolled-back handoffs.
    #[serde(default)]
    pub reason: Option<String>,
    /// When the handoff finished.
    pub timestamp: DateTime<Utc>,
}
