use crate::types::{AgentTask, ExecutionPlan, TaskId};
use conductor_core::{ConductorError, ConductorResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Dependency graph over one task set.
///
/// Edges to tasks outside the set are dropped when the graph is built, so
/// every remaining edge references a task of the same plan.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    tasks: BTreeMap<TaskId, AgentTask>,
}

impl DependencyGraph {
    /// Build the graph. Duplicate task ids and zero timeouts are
    /// configuration errors.
    pub fn from_tasks(tasks: Vec<AgentTask>) -> ConductorResult<Self> {
        let mut map = BTreeMap::new();
        for task in tasks {
            if map.contains_key(&task.id) {
                return Err(ConductorError::Config(format!(
                    "duplicate task id '{}' in plan",
                    task.id
                )));
            }
            if task.timeout_seconds == 0 {
                return Err(ConductorError::Config(format!(
                    "task '{}' has a zero timeout",
                    task.id
                )));
            }
            map.insert(task.id.clone(), task);
        }

        let known: HashSet<TaskId> = map.keys().cloned().collect();
        for task in map.values_mut() {
            let before = task.depends_on.len();
            task.depends_on.retain(|dep| known.contains(dep));
            if task.depends_on.len() != before {
                debug!(
                    task_id = %task.id,
                    dropped = before - task.depends_on.len(),
                    "Dropped dependencies outside the planned task set"
                );
            }
        }

        Ok(Self { tasks: map })
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// First cycle found by depth-first search, as the ids along it with the
    /// starting id repeated at the end. Visits tasks in id order.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut visited: HashMap<&str, Visit> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        for id in self.tasks.keys() {
            if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashMap<&'a str, Visit>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<TaskId>> {
        match visited.get(id) {
            Some(Visit::InProgress) => {
                // back edge: the cycle is the path suffix starting at `id`
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<TaskId> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            Some(Visit::Done) => return None,
            None => {}
        }

        visited.insert(id, Visit::InProgress);
        path.push(id);
        if let Some(task) = self.tasks.get(id) {
            for dep in &task.depends_on {
                if let Some(cycle) = self.dfs_cycle(dep, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        visited.insert(id, Visit::Done);
        None
    }

    /// Topological layers. Fails if the graph has a cycle.
    pub fn layers(mut self) -> ConductorResult<Vec<Vec<AgentTask>>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(ConductorError::DependencyCycle(cycle));
        }

        let mut placed: HashSet<TaskId> = HashSet::new();
        let mut phases = Vec::new();

        while !self.tasks.is_empty() {
            let ready: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| t.is_ready(&placed))
                .map(|t| t.id.clone())
                .collect();

            if ready.is_empty() {
                return Err(ConductorError::DependencyCycle(
                    self.tasks.keys().cloned().collect(),
                ));
            }

            let mut phase: Vec<AgentTask> = ready
                .iter()
                .filter_map(|id| self.tasks.remove(id))
                .collect();
            phase.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

            placed.extend(ready);
            phases.push(phase);
        }

        Ok(phases)
    }
}

/// Validate `tasks` and split them into topological phases.
///
/// No partial plan is ever returned: a cycle, a duplicate id or a zero
/// timeout fails the whole plan before any task can run.
pub fn build_plan(tasks: Vec<AgentTask>) -> ConductorResult<ExecutionPlan> {
    let graph = DependencyGraph::from_tasks(tasks)?;
    let task_count = graph.len();
    let phases = graph.layers()?;
    let plan = ExecutionPlan::new(phases);

    info!(
        plan_id = %plan.id,
        tasks = task_count,
        phases = plan.phase_count(),
        "Execution plan built"
    );

    Ok(plan)
}
