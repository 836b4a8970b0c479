use crate::config::OrchestratorConfig;
use crate::types::{ResourceCost, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Decision for a task asking to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// The task may start now; its cost is already accounted.
    Admitted,
    /// Waiting in the pending queue. It will be returned by a later `release`.
    Queued,
    /// No capacity and the pending queue is full, or the cost is invalid.
    Rejected,
}

/// Budgets enforced by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GovernorLimits {
    /// Maximum number of running tasks.
    pub concurrency_limit: usize,
    /// Maximum number of tasks waiting for capacity.
    pub queue_size: usize,
    /// CPU budget shared by running tasks.
    pub cpu_threshold_percent: f64,
    /// Memory budget shared by running tasks.
    pub memory_threshold_mb: u64,
    /// Fraction of `memory_threshold_mb` that raises the cleanup signal.
    pub cleanup_trigger: f64,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for GovernorLimits {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit,
            queue_size: config.queue_size,
            cpu_threshold_percent: config.cpu_threshold_percent,
            memory_threshold_mb: config.memory_threshold_mb,
            cleanup_trigger: config.cleanup_trigger,
        }
    }
}

/// Point-in-time view of the governor counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorSnapshot {
    /// Running tasks.
    pub active: usize,
    /// Tasks waiting in the pending queue.
    pub queued: usize,
    /// CPU charged by running tasks.
    pub cpu_percent: f64,
    /// Memory charged by running tasks.
    pub memory_mb: u64,
    /// Highest number of tasks that ever ran at once.
    pub peak_active: usize,
    /// Times the cleanup signal was raised.
    pub cleanup_signals: u64,
    /// Tasks turned away.
    pub rejected: u64,
    /// Exclusive resources currently held, by holder.
    #[serde(default)]
    pub locked_resources: BTreeMap<String, TaskId>,
}

/// What a task holds while it runs.
#[derive(Debug, Clone, Default)]
struct Claim {
    cost: ResourceCost,
    resources: BTreeSet<String>,
}

#[derive(Default)]
struct GovernorState {
    active: HashMap<TaskId, Claim>,
    held: BTreeMap<String, TaskId>,
    pending: VecDeque<(TaskId, Claim)>,
    cpu_percent: f64,
    memory_mb: u64,
    peak_active: usize,
    cleanup_signals: u64,
    cleanup_raised: bool,
    cleanup_pending: bool,
    rejected: u64,
}

/// Admission control for running agents.
///
/// One instance is shared by the executor for the lifetime of a run. All
/// counters sit behind a single mutex and are only changed through
/// [`try_admit`](Self::try_admit) and [`release`](Self::release).
pub struct ResourceGovernor {
    limits: GovernorLimits,
    state: Mutex<GovernorState>,
}

impl ResourceGovernor {
    /// Create a new governor with nothing running.
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Create a new governor from the orchestrator budgets.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(GovernorLimits::from(config))
    }

    /// Get the configured budgets.
    pub fn limits(&self) -> GovernorLimits {
        self.limits
    }

    /// Ask to start `task_id` with the given estimated cost.
    ///
    /// Waiting tasks are served first: while a queued task waits for
    /// capacity a new arrival queues behind it even if it would fit.
    pub fn try_admit(&self, task_id: &str, cost: ResourceCost) -> Admission {
        self.try_admit_exclusive(task_id, cost, &BTreeSet::new())
    }

    /// Like [`try_admit`](Self::try_admit), but the task also needs sole
    /// use of every named resource in `resources`.
    ///
    /// A task blocked only by a held resource does not hold up unrelated
    /// arrivals. Costs with a negative or non-finite CPU share are rejected.
    pub fn try_admit_exclusive(
        &self,
        task_id: &str,
        cost: ResourceCost,
        resources: &BTreeSet<String>,
    ) -> Admission {
        let mut state = self.state.lock();

        if !cost.is_valid() {
            state.rejected += 1;
            warn!(
                task_id = %task_id,
                cpu_percent = cost.cpu_percent,
                "Task rejected: invalid resource cost"
            );
            return Admission::Rejected;
        }
        if state.active.contains_key(task_id) {
            return Admission::Admitted;
        }
        if state.pending.iter().any(|(id, _)| id == task_id) {
            return Admission::Queued;
        }

        let claim = Claim {
            cost,
            resources: resources.clone(),
        };
        let waiting_for_capacity = state
            .pending
            .iter()
            .any(|(_, queued)| !Self::locked(&state, queued));

        if !waiting_for_capacity && !Self::locked(&state, &claim) && self.fits(&state, &cost) {
            self.admit(&mut state, task_id.to_string(), claim);
            return Admission::Admitted;
        }

        if state.pending.len() < self.limits.queue_size {
            state.pending.push_back((task_id.to_string(), claim));
            debug!(
                task_id = %task_id,
                queued = state.pending.len(),
                "Task queued awaiting capacity"
            );
            return Admission::Queued;
        }

        state.rejected += 1;
        warn!(
            task_id = %task_id,
            active = state.active.len(),
            queued = state.pending.len(),
            "Task rejected: no capacity and pending queue full"
        );
        Admission::Rejected
    }

    /// Return the resources of a terminal task and admit waiting tasks in
    /// FIFO order. Returns the ids admitted by this release.
    ///
    /// Releasing a task that is still queued withdraws it from the queue.
    pub fn release(&self, task_id: &str) -> Vec<TaskId> {
        let mut state = self.state.lock();

        if let Some(claim) = state.active.remove(task_id) {
            state.cpu_percent = (state.cpu_percent - claim.cost.cpu_percent).max(0.0);
            state.memory_mb = state.memory_mb.saturating_sub(claim.cost.memory_mb);
            for resource in &claim.resources {
                state.held.remove(resource);
            }
            if state.memory_mb < self.cleanup_level() {
                state.cleanup_raised = false;
            }
        } else {
            state.pending.retain(|(id, _)| id != task_id);
        }

        // FIFO, except that entries blocked by a held resource are passed over.
        let mut admitted = Vec::new();
        let mut index = 0;
        while index < state.pending.len() {
            let (locked, fits) = {
                let claim = &state.pending[index].1;
                (Self::locked(&state, claim), self.fits(&state, &claim.cost))
            };
            if locked {
                index += 1;
                continue;
            }
            if !fits {
                break;
            }
            if let Some((id, claim)) = state.pending.remove(index) {
                self.admit(&mut state, id.clone(), claim);
                admitted.push(id);
            }
        }

        if !admitted.is_empty() {
            debug!(
                released = %task_id,
                admitted = admitted.len(),
                "Admitted queued tasks after release"
            );
        }
        admitted
    }

    /// Whether the memory cleanup signal was raised since the last call.
    pub fn take_cleanup_signal(&self) -> bool {
        std::mem::take(&mut self.state.lock().cleanup_pending)
    }

    /// Number of running tasks.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Number of tasks waiting for capacity.
    pub fn queued_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Get a point-in-time copy of the counters.
    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.state.lock();
        GovernorSnapshot {
            active: state.active.len(),
            queued: state.pending.len(),
            cpu_percent: state.cpu_percent,
            memory_mb: state.memory_mb,
            peak_active: state.peak_active,
            cleanup_signals: state.cleanup_signals,
            rejected: state.rejected,
            locked_resources: state.held.clone(),
        }
    }

    fn locked(state: &GovernorState, claim: &Claim) -> bool {
        claim.resources.iter().any(|r| state.held.contains_key(r))
    }

    fn fits(&self, state: &GovernorState, cost: &ResourceCost) -> bool {
        // An oversized task still runs once nothing else holds resources.
        if state.active.is_empty() {
            return self.limits.concurrency_limit > 0;
        }
        state.active.len() < self.limits.concurrency_limit
            && state.cpu_percent + cost.cpu_percent <= self.limits.cpu_threshold_percent
            && state.memory_mb + cost.memory_mb <= self.limits.memory_threshold_mb
    }

    fn admit(&self, state: &mut GovernorState, task_id: TaskId, claim: Claim) {
        state.cpu_percent += claim.cost.cpu_percent;
        state.memory_mb += claim.cost.memory_mb;
        for resource in &claim.resources {
            state.held.insert(resource.clone(), task_id.clone());
        }
        state.active.insert(task_id.clone(), claim);
        state.peak_active = state.peak_active.max(state.active.len());

        debug!(
            task_id = %task_id,
            active = state.active.len(),
            cpu_percent = state.cpu_percent,
            memory_mb = state.memory_mb,
            "Task admitted"
        );

        if !state.cleanup_raised && state.memory_mb >= self.cleanup_level() {
            state.cleanup_raised = true;
            state.cleanup_pending = true;
            state.cleanup_signals += 1;
            info!(
                memory_mb = state.memory_mb,
                threshold_mb = self.limits.memory_threshold_mb,
                "Memory above cleanup trigger, requesting cleanup"
            );
        }
    }

    fn cleanup_level(&self) -> u64 {
        (self.limits.memory_threshold_mb as f64 * self.limits.cleanup_trigger).ceil() as u64
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("limits", &self.limits)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limits(concurrency: usize, queue: usize) -> GovernorLimits {
        GovernorLimits {
            concurrency_limit: concurrency,
            queue_size: queue,
            ..GovernorLimits::default()
        }
    }

    fn small() -> ResourceCost {
        ResourceCost::new(1.0, 10)
    }

    #[test]
    fn test_admits_up_to_concurrency_limit() {
        let governor = ResourceGovernor::new(limits(2, 5));
        assert_eq!(governor.try_admit("a", small()), Admission::Admitted);
        assert_eq!(governor.try_admit("b", small()), Admission::Admitted);
        assert_eq!(governor.try_admit("c", small()), Admission::Queued);
        assert_eq!(governor.active_count(), 2);
        assert_eq!(governor.queued_count(), 1);
    }

    #[test]
    fn test_rejects_when_queue_full() {
        let governor = ResourceGovernor::new(limits(1, 1));
        assert_eq!(governor.try_admit("a", small()), Admission::Admitted);
        assert_eq!(governor.try_admit("b", small()), Admission::Queued);
        assert_eq!(governor.try_admit("c", small()), Admission::Rejected);
        assert_eq!(governor.snapshot().rejected, 1);
    }

    #[test]
    fn test_release_admits_fifo() {
        let governor = ResourceGovernor::new(limits(1, 5));
        governor.try_admit("a", small());
        governor.try_admit("b", small());
        governor.try_admit("c", small());

        assert_eq!(governor.release("a"), vec!["b".to_string()]);
        assert_eq!(governor.release("b"), vec!["c".to_string()]);
        assert!(governor.release("c").is_empty());
        assert_eq!(governor.active_count(), 0);
    }

    #[test]
    fn test_new_arrivals_wait_behind_queue() {
        let governor = ResourceGovernor::new(GovernorLimits {
            memory_threshold_mb: 100,
            ..limits(5, 5)
        });
        governor.try_admit("big-1", ResourceCost::new(0.0, 80));
        assert_eq!(
            governor.try_admit("big-2", ResourceCost::new(0.0, 80)),
            Admission::Queued
        );
        // Would fit on its own, but big-2 is first in line.
        assert_eq!(
            governor.try_admit("tiny", ResourceCost::new(0.0, 5)),
            Admission::Queued
        );
        assert_eq!(governor.release("big-1"), vec!["big-2".to_string(), "tiny".to_string()]);
    }

    #[test]
    fn test_cpu_budget_enforced() {
        let governor = ResourceGovernor::new(limits(10, 5));
        assert_eq!(
            governor.try_admit("a", ResourceCost::new(50.0, 0)),
            Admission::Admitted
        );
        assert_eq!(
            governor.try_admit("b", ResourceCost::new(40.0, 0)),
            Admission::Queued
        );
        assert_eq!(governor.release("a"), vec!["b".to_string()]);
        assert!((governor.snapshot().cpu_percent - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_oversized_task_admitted_when_idle() {
        let governor = ResourceGovernor::new(limits(5, 5));
        assert_eq!(
            governor.try_admit("huge", ResourceCost::new(500.0, 100_000)),
            Admission::Admitted
        );
        assert_eq!(governor.try_admit("next", small()), Admission::Queued);
        assert_eq!(governor.release("huge"), vec!["next".to_string()]);
    }

    #[test]
    fn test_cleanup_signal_raised_once() {
        let governor = ResourceGovernor::new(GovernorLimits {
            memory_threshold_mb: 1_000,
            ..limits(5, 5)
        });
        governor.try_admit("a", ResourceCost::new(0.0, 500));
        assert!(!governor.take_cleanup_signal());

        governor.try_admit("b", ResourceCost::new(0.0, 400));
        assert!(governor.take_cleanup_signal());
        assert!(!governor.take_cleanup_signal());

        // Dropping below the trigger re-arms the signal.
        governor.release("b");
        governor.try_admit("c", ResourceCost::new(0.0, 390));
        assert!(governor.take_cleanup_signal());
        assert_eq!(governor.snapshot().cleanup_signals, 2);
    }

    #[test]
    fn test_release_of_queued_task_withdraws_it() {
        let governor = ResourceGovernor::new(limits(1, 5));
        governor.try_admit("a", small());
        governor.try_admit("b", small());
        assert!(governor.release("b").is_empty());
        assert_eq!(governor.queued_count(), 0);
        assert!(governor.release("a").is_empty());
    }

    #[test]
    fn test_invalid_cost_is_rejected() {
        let governor = ResourceGovernor::new(limits(10, 10));
        assert_eq!(
            governor.try_admit("neg", ResourceCost::new(-100.0, 0)),
            Admission::Rejected
        );
        assert_eq!(
            governor.try_admit("nan", ResourceCost::new(f64::NAN, 0)),
            Admission::Rejected
        );
        assert_eq!(governor.snapshot().rejected, 2);
        assert_eq!(governor.snapshot().cpu_percent, 0.0);

        // A negative cost must not open room for work beyond the CPU budget.
        let hog = ResourceCost::new(60.0, 0);
        assert_eq!(governor.try_admit("a", hog), Admission::Admitted);
        assert_eq!(governor.try_admit("b", hog), Admission::Queued);
        assert_eq!(governor.try_admit("c", hog), Admission::Queued);
        assert!(governor.snapshot().cpu_percent <= 80.0);
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_exclusive_resource_serializes_holders() {
        let governor = ResourceGovernor::new(limits(5, 5));
        let db = set(&["database"]);
        assert_eq!(
            governor.try_admit_exclusive("m1", small(), &db),
            Admission::Admitted
        );
        assert_eq!(
            governor.try_admit_exclusive("m2", small(), &db),
            Admission::Queued
        );
        assert_eq!(
            governor.snapshot().locked_resources.get("database").map(String::as_str),
            Some("m1")
        );

        // Unrelated work is not held up by the lock-blocked task.
        assert_eq!(governor.try_admit("docs", small()), Admission::Admitted);
        assert_eq!(governor.active_count(), 2);

        assert_eq!(governor.release("m1"), vec!["m2".to_string()]);
        assert_eq!(
            governor.snapshot().locked_resources.get("database").map(String::as_str),
            Some("m2")
        );
        assert!(governor.release("m2").is_empty());
        assert!(governor.snapshot().locked_resources.is_empty());
    }

    #[test]
    fn test_lock_blocked_entry_does_not_stall_queue() {
        let governor = ResourceGovernor::new(limits(2, 5));
        let db = set(&["database"]);
        governor.try_admit_exclusive("m1", small(), &db);
        governor.try_admit("x", small());
        assert_eq!(
            governor.try_admit_exclusive("m2", small(), &db),
            Admission::Queued
        );
        assert_eq!(governor.try_admit("y", small()), Admission::Queued);

        // m2 is still blocked by m1, so y goes first.
        assert_eq!(governor.release("x"), vec!["y".to_string()]);
        assert_eq!(governor.release("y"), Vec::<String>::new());
        assert_eq!(governor.release("m1"), vec!["m2".to_string()]);
    }

    #[test]
    fn test_peak_never_exceeds_limit() {
        let governor = ResourceGovernor::new(limits(3, 20));
        for i in 0..10 {
            governor.try_admit(&format!("t{i}"), small());
        }
        for i in 0..10 {
            governor.release(&format!("t{i}"));
            assert!(governor.active_count() <= 3);
        }
        assert_eq!(governor.snapshot().peak_active, 3);
        assert_eq!(governor.active_count(), 0);
    }
}
