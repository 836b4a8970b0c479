use crate::backend::AgentBackend;
use crate::config::OrchestratorConfig;
use crate::governor::{Admission, ResourceGovernor};
use crate::monitor::{ExecutionMonitor, OrchestrationEvent};
use crate::profiles::CapabilityRegistry;
use crate::types::{
    AgentTask, ExecutionPlan, ExecutionResult, ResourceCost, TaskId, TaskResult, TaskStatus,
};
use chrono::Utc;
use conductor_core::ConductorError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default time a timed-out task gets to observe its cancellation.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(1_000);

/// Runs execution plans phase by phase under a [`ResourceGovernor`].
///
/// One executor drives one plan at a time: the governor's pending queue is
/// drained from this executor's control flow, so a governor must not be
/// shared by executors running concurrently.
pub struct ParallelExecutor {
    governor: Arc<ResourceGovernor>,
    backend: Arc<dyn AgentBackend>,
    registry: Arc<dyn CapabilityRegistry>,
    monitor: ExecutionMonitor,
    cancel_grace: Duration,
    cancel: CancellationToken,
}

impl ParallelExecutor {
    /// Create a new executor with its own monitor and cancellation token.
    pub fn new(
        governor: Arc<ResourceGovernor>,
        backend: Arc<dyn AgentBackend>,
        registry: Arc<dyn CapabilityRegistry>,
    ) -> Self {
        Self {
            governor,
            backend,
            registry,
            monitor: ExecutionMonitor::new(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a new executor with a governor built from `config`.
    pub fn from_config(
        config: &OrchestratorConfig,
        backend: Arc<dyn AgentBackend>,
        registry: Arc<dyn CapabilityRegistry>,
    ) -> Self {
        Self::new(
            Arc::new(ResourceGovernor::from_config(config)),
            backend,
            registry,
        )
        .with_cancel_grace(Duration::from_millis(config.cancel_grace_ms))
    }

    /// Publish events on `monitor` instead of a private one.
    pub fn with_monitor(mut self, monitor: ExecutionMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set how long a timed-out task may take to observe cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Use `token` as the plan-level cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token stops running tasks and skips the rest.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Get a reference to the execution monitor.
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// Get a reference to the resource governor.
    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    /// Run every phase of `plan` in order. Each phase is a barrier.
    ///
    /// Every task of the plan appears exactly once in the result.
    pub async fn run_plan(&self, plan: &ExecutionPlan) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            plan_id = %plan.id,
            phases = plan.phase_count(),
            tasks = plan.task_count(),
            "Starting plan execution"
        );
        self.monitor.emit(OrchestrationEvent::PlanStarted {
            plan_id: plan.id,
            phases: plan.phase_count(),
            tasks: plan.task_count(),
        });

        let mut results: BTreeMap<TaskId, TaskResult> = BTreeMap::new();
        for (index, phase) in plan.phases.iter().enumerate() {
            self.monitor.emit(OrchestrationEvent::PhaseStarted {
                plan_id: plan.id,
                phase: index,
                tasks: phase.len(),
            });
            info!(plan_id = %plan.id, phase = index, tasks = phase.len(), "Phase started");

            let phase_results = self.run_phase(plan.id, index, phase, &results).await;

            let succeeded = phase_results
                .values()
                .filter(|r| r.status == TaskStatus::Succeeded)
                .count();
            let unsuccessful = phase_results.len() - succeeded;
            info!(
                plan_id = %plan.id,
                phase = index,
                succeeded,
                unsuccessful,
                "Phase completed"
            );
            self.monitor.emit(OrchestrationEvent::PhaseCompleted {
                plan_id: plan.id,
                phase: index,
                succeeded,
                unsuccessful,
            });

            results.extend(phase_results);
        }

        let result = ExecutionResult::from_results(
            plan.id,
            results,
            started_at,
            start.elapsed().as_millis() as u64,
        );

        info!(plan_id = %plan.id, summary = %result.summary(), "Plan execution finished");
        self.monitor.emit(OrchestrationEvent::PlanCompleted {
            plan_id: plan.id,
            succeeded: result.succeeded,
            failed: result.failed,
            timed_out: result.timed_out,
            skipped: result.skipped,
            duration_ms: result.total_duration_ms,
        });

        result
    }

    /// Run one phase concurrently and wait for all of its tasks.
    ///
    /// `prior` holds the results of earlier phases. A task whose dependency
    /// is missing from `prior` or did not succeed is skipped without being
    /// submitted. Otherwise the task receives the outputs of its
    /// dependencies, see [`invocation_input`].
    pub async fn run_phase(
        &self,
        plan_id: Uuid,
        phase: usize,
        tasks: &[AgentTask],
        prior: &BTreeMap<TaskId, TaskResult>,
    ) -> BTreeMap<TaskId, TaskResult> {
        let mut results = BTreeMap::new();
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut running: HashSet<TaskId> = HashSet::new();
        let mut queued: HashMap<TaskId, (AgentTask, Value, ResourceCost)> = HashMap::new();

        for task in tasks {
            if let Some(reason) = self.skip_reason(task, prior) {
                debug!(plan_id = %plan_id, task_id = %task.id, reason = %reason, "Skipping task");
                self.finish(plan_id, &mut results, TaskResult::skipped(task, phase, reason))
                    .await;
                continue;
            }

            let Some(profile) = self.registry.lookup(&task.agent_id) else {
                let err = ConductorError::Registry(format!("Unknown agent: {}", task.agent_id));
                warn!(plan_id = %plan_id, task_id = %task.id, error = %err, "Task failed");
                let result = TaskResult::from_error(task, phase, &err, 0, ResourceCost::default());
                self.finish(plan_id, &mut results, result).await;
                continue;
            };
            let cost = profile.estimated_resource_cost;
            let resources: BTreeSet<String> = profile
                .exclusive_resources
                .union(&task.exclusive_resources)
                .cloned()
                .collect();
            let input = invocation_input(task, prior);

            match self.governor.try_admit_exclusive(&task.id, cost, &resources) {
                Admission::Admitted => {
                    self.spawn(plan_id, phase, task.clone(), input, cost, &mut join_set)
                        .await;
                    running.insert(task.id.clone());
                }
                Admission::Queued => {
                    self.monitor.task_queued(plan_id, &task.id, &task.agent_id);
                    queued.insert(task.id.clone(), (task.clone(), input, cost));
                }
                Admission::Rejected => {
                    let err = ConductorError::ResourceExhausted(format!(
                        "task '{}' rejected by the resource governor",
                        task.id
                    ));
                    let result =
                        TaskResult::from_error(task, phase, &err, 0, ResourceCost::default());
                    self.finish(plan_id, &mut results, result).await;
                }
            }
            self.check_cleanup();
        }

        while let Some(joined) = join_set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(plan_id = %plan_id, error = %e, "Task wrapper failed to join");
                    continue;
                }
            };
            running.remove(&result.task_id);

            let mut admitted: VecDeque<TaskId> = self.governor.release(&result.task_id).into();
            self.finish(plan_id, &mut results, result).await;

            while let Some(id) = admitted.pop_front() {
                let Some((task, input, cost)) = queued.remove(&id) else {
                    continue;
                };
                if self.cancel.is_cancelled() {
                    admitted.extend(self.governor.release(&id));
                    let result = TaskResult::skipped(&task, phase, "plan cancelled");
                    self.finish(plan_id, &mut results, result).await;
                    continue;
                }
                self.spawn(plan_id, phase, task, input, cost, &mut join_set)
                    .await;
                running.insert(id);
            }
            self.check_cleanup();
        }

        // Only reachable if a wrapper task was aborted or panicked.
        for id in running {
            self.governor.release(&id);
            if let Some(task) = tasks.iter().find(|t| t.id == id) {
                let err = ConductorError::Execution(format!("task '{id}' did not report a result"));
                let result = TaskResult::from_error(task, phase, &err, 0, ResourceCost::default());
                self.finish(plan_id, &mut results, result).await;
            }
        }
        for (id, (task, _, _)) in queued {
            self.governor.release(&id);
            let result = TaskResult::skipped(&task, phase, "never admitted");
            self.finish(plan_id, &mut results, result).await;
        }

        results
    }

    fn skip_reason(
        &self,
        task: &AgentTask,
        prior: &BTreeMap<TaskId, TaskResult>,
    ) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some("plan cancelled".to_string());
        }
        for dep in &task.depends_on {
            match prior.get(dep) {
                None => return Some(format!("dependency '{dep}' has not completed")),
                Some(r) if r.status.blocks_dependants() => {
                    return Some(format!("dependency '{dep}' {}", r.status));
                }
                Some(_) => {}
            }
        }
        None
    }

    async fn spawn(
        &self,
        plan_id: Uuid,
        phase: usize,
        task: AgentTask,
        input: Value,
        cost: ResourceCost,
        join_set: &mut JoinSet<TaskResult>,
    ) {
        self.monitor
            .task_started(plan_id, &task.id, &task.agent_id)
            .await;
        let backend = Arc::clone(&self.backend);
        let cancel = self.cancel.child_token();
        let grace = self.cancel_grace;
        join_set.spawn(run_task(backend, task, input, phase, cost, cancel, grace));
    }

    async fn finish(
        &self,
        plan_id: Uuid,
        results: &mut BTreeMap<TaskId, TaskResult>,
        result: TaskResult,
    ) {
        self.monitor.task_finished(plan_id, &result).await;
        results.insert(result.task_id.clone(), result);
    }

    fn check_cleanup(&self) {
        if self.governor.take_cleanup_signal() {
            let snapshot = self.governor.snapshot();
            self.monitor.emit(OrchestrationEvent::CleanupTriggered {
                memory_mb: snapshot.memory_mb,
                threshold_mb: self.governor.limits().memory_threshold_mb,
            });
        }
    }
}

/// Input handed to the agent running `task`.
///
/// The task payload sits under `input`; `dependencies` maps each dependency
/// id to its output, or null when `prior` holds no output for it.
pub fn invocation_input(task: &AgentTask, prior: &BTreeMap<TaskId, TaskResult>) -> Value {
    let dependencies: serde_json::Map<String, Value> = task
        .depends_on
        .iter()
        .map(|dep| {
            let output = prior
                .get(dep)
                .and_then(|r| r.output.clone())
                .unwrap_or(Value::Null);
            (dep.clone(), output)
        })
        .collect();
    serde_json::json!({
        "input": task.input_payload,
        "dependencies": dependencies,
    })
}

/// Invoke one task with its timeout. Never panics: a panicking agent is
/// reported as a failed task.
async fn run_task(
    backend: Arc<dyn AgentBackend>,
    task: AgentTask,
    input: Value,
    phase: usize,
    usage: ResourceCost,
    cancel: CancellationToken,
    grace: Duration,
) -> TaskResult {
    let start = Instant::now();
    let timeout = Duration::from_secs(task.timeout_seconds);

    let agent_id = task.agent_id.clone();
    let token = cancel.clone();
    let mut handle =
        tokio::spawn(async move { backend.invoke(&agent_id, input, token).await });

    let joined = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = tokio::time::sleep(timeout) => None,
    };

    match joined {
        Some(Ok(Ok(output))) => {
            let elapsed = start.elapsed().as_millis() as u64;
            info!(task_id = %task.id, agent = %task.agent_id, duration_ms = elapsed, "Task succeeded");
            TaskResult::succeeded(&task, phase, output, elapsed, usage)
        }
        Some(Ok(Err(e))) => {
            let elapsed = start.elapsed().as_millis() as u64;
            warn!(task_id = %task.id, agent = %task.agent_id, error = %e, "Task failed");
            TaskResult::from_error(&task, phase, &e, elapsed, usage)
        }
        Some(Err(join_err)) => {
            let elapsed = start.elapsed().as_millis() as u64;
            let err = ConductorError::Execution(format!("agent panicked: {join_err}"));
            error!(task_id = %task.id, agent = %task.agent_id, error = %err, "Task failed");
            TaskResult::from_error(&task, phase, &err, elapsed, usage)
        }
        None => {
            cancel.cancel();
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(
                    task_id = %task.id,
                    grace_ms = grace.as_millis() as u64,
                    "Agent ignored cancellation, aborting"
                );
                handle.abort();
            }
            let elapsed = start.elapsed().as_millis() as u64;
            let err = ConductorError::TimedOut {
                task_id: task.id.clone(),
                timeout_secs: task.timeout_seconds,
            };
            warn!(task_id = %task.id, agent = %task.agent_id, error = %err, "Task timed out");
            TaskResult::from_error(&task, phase, &err, elapsed, usage)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::{Agent, AgentPool, EchoAgent};
    use crate::governor::GovernorLimits;
    use crate::planner::build_plan;
    use crate::profiles::ProfileRegistry;
    use crate::types::AgentProfile;
    use async_trait::async_trait;
    use conductor_core::{ConductorResult, ErrorKind};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records start/end events and tracks peak concurrency.
    struct TracingAgent {
        id: String,
        delay: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for TracingAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, _: Value, _: CancellationToken) -> ConductorResult<Value> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.log.lock().push(format!("start:{}", self.id));
            tokio::time::sleep(self.delay).await;
            self.log.lock().push(format!("end:{}", self.id));
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(ConductorError::Execution(format!("{} failed", self.id)))
            } else {
                Ok(Value::String(self.id.clone()))
            }
        }
    }

    struct Harness {
        pool: AgentPool,
        profiles: Vec<AgentProfile>,
        log: Arc<Mutex<Vec<String>>>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                pool: AgentPool::new(),
                profiles: Vec::new(),
                log: Arc::new(Mutex::new(Vec::new())),
                current: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn agent(self, id: &str, delay_ms: u64, fail: bool) -> Self {
            self.agent_holding(id, delay_ms, fail, &[])
        }

        fn agent_holding(mut self, id: &str, delay_ms: u64, fail: bool, locks: &[&str]) -> Self {
            self.pool.register(Arc::new(TracingAgent {
                id: id.to_string(),
                delay: Duration::from_millis(delay_ms),
                fail,
                log: Arc::clone(&self.log),
                current: Arc::clone(&self.current),
                peak: Arc::clone(&self.peak),
            }));
            self.profiles.push(
                AgentProfile::new(id, ["test"])
                    .with_cost(1.0, 16)
                    .with_exclusive_resources(locks.iter().copied()),
            );
            self
        }

        fn build(
            self,
            limits: GovernorLimits,
        ) -> (ParallelExecutor, Arc<Mutex<Vec<String>>>, Arc<AtomicUsize>) {
            let executor = ParallelExecutor::new(
                Arc::new(ResourceGovernor::new(limits)),
                Arc::new(self.pool),
                Arc::new(ProfileRegistry::new(self.profiles)),
            );
            (executor, self.log, self.peak)
        }
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependants_start_after_dependencies_finish() {
        let (executor, log, _) = Harness::new()
            .agent("a", 100, false)
            .agent("b", 300, false)
            .agent("c", 10, false)
            .build(GovernorLimits::default());

        let plan = build_plan(vec![
            AgentTask::new("a", "a"),
            AgentTask::new("b", "b"),
            AgentTask::new("c", "c").with_dependencies(["a", "b"]),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert!(result.is_success(), "{}", result.summary());
        let log = log.lock().clone();
        let c_start = position(&log, "start:c");
        assert!(position(&log, "end:a") < c_start);
        assert!(position(&log, "end:b") < c_start);
        assert_eq!(result.tasks["c"].phase, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let mut harness = Harness::new();
        let mut tasks = Vec::new();
        for i in 0..12 {
            let id = format!("w{i}");
            harness = harness.agent(&id, 50 + 10 * i, false);
            tasks.push(AgentTask::new(id.clone(), id));
        }
        let (executor, _, peak) = harness.build(GovernorLimits {
            concurrency_limit: 3,
            queue_size: 20,
            ..GovernorLimits::default()
        });

        let result = executor.run_plan(&build_plan(tasks).unwrap()).await;

        assert_eq!(result.succeeded, 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(executor.governor().snapshot().peak_active, 3);
        assert_eq!(executor.governor().active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_skips_dependants_only() {
        let (executor, log, _) = Harness::new()
            .agent("a", 10, true)
            .agent("b", 10, false)
            .agent("c", 10, false)
            .agent("d", 10, false)
            .build(GovernorLimits::default());

        let plan = build_plan(vec![
            AgentTask::new("a", "a"),
            AgentTask::new("b", "b"),
            AgentTask::new("c", "c").with_dependencies(["a", "b"]),
            AgentTask::new("d", "d").with_dependencies(["c"]),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert_eq!(result.status_of("a"), Some(TaskStatus::Failed));
        assert_eq!(result.status_of("b"), Some(TaskStatus::Succeeded));
        assert_eq!(result.status_of("c"), Some(TaskStatus::Skipped));
        assert_eq!(result.status_of("d"), Some(TaskStatus::Skipped));
        assert_eq!(result.total_tasks(), 4);
        assert!(!log.lock().iter().any(|e| e == "start:c"));
        assert_eq!(result.tasks["a"].error_kind, Some(ErrorKind::ExecutionFailure));
    }

    struct CancellableAgent {
        observed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Agent for CancellableAgent {
        fn id(&self) -> &str {
            "slow"
        }

        async fn invoke(&self, _: Value, cancel: CancellationToken) -> ConductorResult<Value> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.observed.store(true, Ordering::SeqCst);
                    Err(ConductorError::Execution("cancelled".into()))
                }
                _ = tokio::time::sleep(Duration::from_secs(3_600)) => Ok(Value::Null),
            }
        }
    }

    struct StubbornAgent;

    #[async_trait]
    impl Agent for StubbornAgent {
        fn id(&self) -> &str {
            "stubborn"
        }

        async fn invoke(&self, _: Value, _: CancellationToken) -> ConductorResult<Value> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(Value::Null)
        }
    }

    fn executor_for(pool: AgentPool, ids: &[&str]) -> ParallelExecutor {
        let profiles = ids.iter().map(|id| AgentProfile::new(*id, ["test"]));
        ParallelExecutor::new(
            Arc::new(ResourceGovernor::new(GovernorLimits::default())),
            Arc::new(pool),
            Arc::new(ProfileRegistry::new(profiles)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_task() {
        let observed = Arc::new(AtomicBool::new(false));
        let mut pool = AgentPool::new();
        pool.register(Arc::new(CancellableAgent {
            observed: Arc::clone(&observed),
        }));
        let executor = executor_for(pool, &["slow"]);

        let plan = build_plan(vec![AgentTask::new("t", "slow").with_timeout(2)]).unwrap();
        let result = executor.run_plan(&plan).await;

        assert_eq!(result.status_of("t"), Some(TaskStatus::TimedOut));
        assert_eq!(result.tasks["t"].error_kind, Some(ErrorKind::TimedOut));
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_ignoring_cancellation_is_aborted() {
        let mut pool = AgentPool::new();
        pool.register(Arc::new(StubbornAgent));
        pool.register(Arc::new(EchoAgent::new("after")));
        let executor = executor_for(pool, &["stubborn", "after"])
            .with_cancel_grace(Duration::from_millis(200));

        let plan = build_plan(vec![
            AgentTask::new("s", "stubborn").with_timeout(1),
            AgentTask::new("next", "after").with_dependencies(["s"]),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert_eq!(result.status_of("s"), Some(TaskStatus::TimedOut));
        assert_eq!(result.status_of("next"), Some(TaskStatus::Skipped));
        assert!(result.tasks["s"].duration_ms < 1_500);
    }

    #[tokio::test]
    async fn test_unknown_agent_fails_task() {
        let executor = executor_for(AgentPool::new(), &[]);
        let plan = build_plan(vec![AgentTask::new("t", "ghost")]).unwrap();
        let result = executor.run_plan(&plan).await;
        assert_eq!(result.status_of("t"), Some(TaskStatus::Failed));
        assert_eq!(result.tasks["t"].error_kind, Some(ErrorKind::Registry));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_tasks_recorded_as_failed() {
        let mut harness = Harness::new();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let id = format!("r{i}");
            harness = harness.agent(&id, 20, false);
            tasks.push(AgentTask::new(id.clone(), id));
        }
        let (executor, _, _) = harness.build(GovernorLimits {
            concurrency_limit: 1,
            queue_size: 1,
            ..GovernorLimits::default()
        });

        let result = executor.run_plan(&build_plan(tasks).unwrap()).await;

        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        let rejected = result
            .tasks
            .values()
            .find(|r| r.status == TaskStatus::Failed)
            .unwrap();
        assert_eq!(rejected.error_kind, Some(ErrorKind::ResourceExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_resource_holders_never_overlap() {
        let (executor, log, peak) = Harness::new()
            .agent_holding("migrate-users", 100, false, &["database"])
            .agent_holding("migrate-orders", 100, false, &["database"])
            .agent("docs", 100, false)
            .build(GovernorLimits::default());

        let plan = build_plan(vec![
            AgentTask::new("migrate-users", "migrate-users").with_priority(2),
            AgentTask::new("migrate-orders", "migrate-orders").with_priority(1),
            AgentTask::new("docs", "docs"),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert!(result.is_success(), "{}", result.summary());
        let log = log.lock().clone();
        assert!(position(&log, "end:migrate-users") < position(&log, "start:migrate-orders"));
        // The unrelated task ran alongside the first migration.
        assert!(position(&log, "start:docs") < position(&log, "end:migrate-users"));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert!(executor.governor().snapshot().locked_resources.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_level_resources_are_locked() {
        let (executor, log, _) = Harness::new()
            .agent("a", 50, false)
            .agent("b", 50, false)
            .build(GovernorLimits::default());

        let plan = build_plan(vec![
            AgentTask::new("a", "a").with_priority(1).with_exclusive_resources(["cache"]),
            AgentTask::new("b", "b").with_exclusive_resources(["cache"]),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert_eq!(result.succeeded, 2);
        let log = log.lock().clone();
        assert!(position(&log, "end:a") < position(&log, "start:b"));
    }

    #[tokio::test]
    async fn test_dependants_receive_dependency_outputs() {
        let mut pool = AgentPool::new();
        pool.register(Arc::new(EchoAgent::new("spec")));
        pool.register(Arc::new(EchoAgent::new("impl")));
        let executor = executor_for(pool, &["spec", "impl"]);

        let plan = build_plan(vec![
            AgentTask::new("a", "spec").with_payload(serde_json::json!({"ticket": 7})),
            AgentTask::new("b", "impl")
                .with_payload(serde_json::json!({"ticket": 8}))
                .with_dependencies(["a"]),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert!(result.is_success(), "{}", result.summary());
        let a = result.tasks["a"].output.clone().unwrap();
        assert_eq!(a["input"]["input"]["ticket"], 7);
        assert_eq!(a["input"]["dependencies"], serde_json::json!({}));

        let b = result.tasks["b"].output.clone().unwrap();
        assert_eq!(b["input"]["input"]["ticket"], 8);
        assert_eq!(b["input"]["dependencies"]["a"], a);
    }

    #[test]
    fn test_invocation_input_without_prior_output() {
        let task = AgentTask::new("b", "impl").with_dependencies(["a"]);
        let input = invocation_input(&task, &BTreeMap::new());
        assert_eq!(input["dependencies"]["a"], Value::Null);
        assert_eq!(input["input"], Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_cost_profile_cannot_bypass_cpu_budget() {
        let mut pool = AgentPool::new();
        for id in ["rogue", "w1", "w2", "w3"] {
            pool.register(Arc::new(EchoAgent::new(id).with_delay(Duration::from_millis(50))));
        }
        let profiles = vec![
            AgentProfile::new("rogue", ["test"]).with_cost(-100.0, 0),
            AgentProfile::new("w1", ["test"]).with_cost(60.0, 0),
            AgentProfile::new("w2", ["test"]).with_cost(60.0, 0),
            AgentProfile::new("w3", ["test"]).with_cost(60.0, 0),
        ];
        let executor = ParallelExecutor::new(
            Arc::new(ResourceGovernor::new(GovernorLimits::default())),
            Arc::new(pool),
            Arc::new(ProfileRegistry::new(profiles)),
        );

        let plan = build_plan(vec![
            AgentTask::new("rogue", "rogue").with_priority(9),
            AgentTask::new("w1", "w1"),
            AgentTask::new("w2", "w2"),
            AgentTask::new("w3", "w3"),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;

        assert_eq!(result.status_of("rogue"), Some(TaskStatus::Failed));
        assert_eq!(
            result.tasks["rogue"].error_kind,
            Some(ErrorKind::ResourceExhausted)
        );
        assert_eq!(result.succeeded, 3);
        assert_eq!(executor.governor().snapshot().peak_active, 1);
    }

    #[tokio::test]
    async fn test_cancelled_plan_skips_everything() {
        let mut pool = AgentPool::new();
        pool.register(Arc::new(EchoAgent::new("a")));
        let executor = executor_for(pool, &["a"]);
        executor.cancellation_token().cancel();

        let plan = build_plan(vec![
            AgentTask::new("one", "a"),
            AgentTask::new("two", "a").with_dependencies(["one"]),
        ])
        .unwrap();
        let result = executor.run_plan(&plan).await;
        assert_eq!(result.skipped, 2);
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let mut pool = AgentPool::new();
        pool.register(Arc::new(EchoAgent::new("a")));
        let executor = executor_for(pool, &["a"]);
        let mut rx = executor.monitor().subscribe();

        let plan = build_plan(vec![AgentTask::new("one", "a")]).unwrap();
        executor.run_plan(&plan).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["event"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("plan_started"));
        assert_eq!(kinds.last().map(String::as_str), Some("plan_completed"));
        assert!(kinds.iter().any(|k| k == "phase_completed"));
    }
}
