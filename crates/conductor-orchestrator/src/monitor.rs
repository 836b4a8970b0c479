use crate::types::{AgentId, TaskId, TaskResult, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle state of a task as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for governor capacity.
    Queued,
    /// Running on its agent.
    Running,
    /// Finished with an output.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled after its timeout.
    TimedOut,
    /// Never started.
    Skipped,
}

impl From<TaskStatus> for TaskState {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Succeeded => TaskState::Succeeded,
            TaskStatus::Failed => TaskState::Failed,
            TaskStatus::TimedOut => TaskState::TimedOut,
            TaskStatus::Skipped => TaskState::Skipped,
        }
    }
}

/// Events published while a plan runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A plan began executing.
    PlanStarted {
        /// Plan id.
        plan_id: Uuid,
        /// Number of phases.
        phases: usize,
        /// Number of tasks.
        tasks: usize,
    },
    /// A phase began.
    PhaseStarted {
        /// Plan id.
        plan_id: Uuid,
        /// Phase index.
        phase: usize,
        /// Tasks in the phase.
        tasks: usize,
    },
    /// A task moved to a new state.
    TaskStateChanged {
        /// Plan id.
        plan_id: Uuid,
        /// Task id.
        task_id: TaskId,
        /// Agent bound to the task.
        agent_id: AgentId,
        /// New state.
        state: TaskState,
    },
    /// Every task of a phase is terminal.
    PhaseCompleted {
        /// Plan id.
        plan_id: Uuid,
        /// Phase index.
        phase: usize,
        /// Tasks that succeeded.
        succeeded: usize,
        /// Tasks that failed, timed out or were skipped.
        unsuccessful: usize,
    },
    /// The plan finished.
    PlanCompleted {
        /// Plan id.
        plan_id: Uuid,
        /// Succeeded tasks.
        succeeded: usize,
        /// Failed tasks.
        failed: usize,
        /// Timed-out tasks.
        timed_out: usize,
        /// Skipped tasks.
        skipped: usize,
        /// Wall-clock time of the plan.
        duration_ms: u64,
    },
    /// Admitted memory crossed the cleanup trigger.
    CleanupTriggered {
        /// Memory charged when the signal was raised.
        memory_mb: u64,
        /// Configured memory budget.
        threshold_mb: u64,
    },
}

/// Whether an agent currently runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// No task assigned.
    Idle,
    /// Running a task.
    Running,
}

/// Counters accumulated per agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks that actually ran.
    pub runs: u64,
    /// Succeeded tasks.
    pub succeeded: u64,
    /// Failed tasks.
    pub failed: u64,
    /// Timed-out tasks.
    pub timed_out: u64,
    /// Skipped tasks.
    pub skipped: u64,
    /// Total run time of tasks that ran.
    pub duration_ms: u64,
}

impl AgentMetrics {
    fn add(&mut self, other: &AgentMetrics) {
        self.runs += other.runs;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.skipped += other.skipped;
        self.duration_ms += other.duration_ms;
    }
}

/// Observed state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    /// Observed agent.
    pub agent_id: AgentId,
    /// Whether it is running a task.
    pub status: WorkerStatus,
    /// Task it is running, if any.
    pub current_task: Option<TaskId>,
    /// Counters so far.
    pub metrics: AgentMetrics,
}

impl AgentActivity {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: WorkerStatus::Idle,
            current_task: None,
            metrics: AgentMetrics::default(),
        }
    }
}

/// Observability feed for plan execution.
///
/// Publishes [`OrchestrationEvent`]s on a broadcast channel and keeps
/// per-agent metrics for dashboards. Publishing never blocks and events are
/// dropped when nobody subscribes.
#[derive(Clone)]
pub struct ExecutionMonitor {
    events: broadcast::Sender<OrchestrationEvent>,
    agents: Arc<RwLock<HashMap<AgentId, AgentActivity>>>,
}

impl ExecutionMonitor {
    /// Create a new monitor with the default event capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a new monitor whose channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    /// Publish `event` to current subscribers.
    pub fn emit(&self, event: OrchestrationEvent) {
        // Err only means there are no subscribers.
        let _ = self.events.send(event);
    }

    /// Mark a task as running on its agent.
    pub async fn task_started(&self, plan_id: Uuid, task_id: &str, agent_id: &str) {
        {
            let mut agents = self.agents.write().await;
            let activity = agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentActivity::new(agent_id));
            activity.status = WorkerStatus::Running;
            activity.current_task = Some(task_id.to_string());
        }
        self.emit(OrchestrationEvent::TaskStateChanged {
            plan_id,
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            state: TaskState::Running,
        });
    }

    /// Mark a task as waiting for capacity.
    pub fn task_queued(&self, plan_id: Uuid, task_id: &str, agent_id: &str) {
        self.emit(OrchestrationEvent::TaskStateChanged {
            plan_id,
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            state: TaskState::Queued,
        });
    }

    /// Record a terminal task result.
    pub async fn task_finished(&self, plan_id: Uuid, result: &TaskResult) {
        {
            let mut agents = self.agents.write().await;
            let activity = agents
                .entry(result.agent_id.clone())
                .or_insert_with(|| AgentActivity::new(&result.agent_id));
            if activity.current_task.as_deref() == Some(result.task_id.as_str()) {
                activity.current_task = None;
                activity.status = WorkerStatus::Idle;
            }
            let metrics = &mut activity.metrics;
            match result.status {
                TaskStatus::Succeeded => metrics.succeeded += 1,
                TaskStatus::Failed => metrics.failed += 1,
                TaskStatus::TimedOut => metrics.timed_out += 1,
                TaskStatus::Skipped => metrics.skipped += 1,
            }
            if result.status != TaskStatus::Skipped {
                metrics.runs += 1;
                metrics.duration_ms += result.duration_ms;
            }
        }
        self.emit(OrchestrationEvent::TaskStateChanged {
            plan_id,
            task_id: result.task_id.clone(),
            agent_id: result.agent_id.clone(),
            state: result.status.into(),
        });
    }

    /// Get a snapshot of all observed agents, ordered by id.
    pub async fn snapshot(&self) -> Vec<AgentActivity> {
        let agents = self.agents.read().await;
        let mut states: Vec<AgentActivity> = agents.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        states
    }

    /// Get the observed state of one agent.
    pub async fn get_state(&self, agent_id: &str) -> Option<AgentActivity> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Sum of the metrics of every observed agent.
    pub async fn aggregate_metrics(&self) -> AgentMetrics {
        let agents = self.agents.read().await;
        let mut total = AgentMetrics::default();
        for activity in agents.values() {
            total.add(&activity.metrics);
        }
        total
    }

    /// Serialize the current state as JSON for dashboards.
    pub async fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "agents": agents,
            "aggregate": aggregate,
        })
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
