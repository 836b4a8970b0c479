use crate::backend::AgentBackend;
use crate::config::{ConductorConfig, OrchestratorConfig};
use crate::executor::ParallelExecutor;
use crate::handoff::HandoffManager;
use crate::health::HealthMonitor;
use crate::monitor::ExecutionMonitor;
use crate::planner::build_plan;
use crate::profiles::{default_dependency_rules, default_profiles, CapabilityRegistry, DependencyRules, ProfileRegistry};
use crate::selector::{AgentSelector, Selection};
use crate::store::ResultStore;
use crate::types::{ExecutionPlan, ExecutionResult, Request};
use conductor_core::ConductorResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Everything produced by one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationOutcome {
    /// Agents chosen for the request.
    pub selection: Selection,
    /// Plan built from the selection.
    pub plan: ExecutionPlan,
    /// Result of running the plan.
    pub result: ExecutionResult,
}

/// The orchestration pipeline: select → plan → execute → persist.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<ProfileRegistry>,
    rules: DependencyRules,
    selector: AgentSelector,
    executor: ParallelExecutor,
    store: Option<Arc<dyn ResultStore>>,
}

impl Orchestrator {
    /// Build from a loaded configuration. Empty profile or dependency
    /// sections fall back to the built-in pipeline.
    pub fn new(config: ConductorConfig, backend: Arc<dyn AgentBackend>) -> ConductorResult<Self> {
        config.validate()?;

        let profiles = if config.profiles.is_empty() {
            default_profiles()
        } else {
            config.profiles
        };
        let rules = if config.dependencies.is_empty() {
            default_dependency_rules()
        } else {
            DependencyRules::from_map(&config.dependencies)
        };

        let registry = Arc::new(ProfileRegistry::new(profiles));
        let selector = AgentSelector::from_config(&config.orchestrator)?;
        let executor = ParallelExecutor::from_config(
            &config.orchestrator,
            backend,
            Arc::clone(&registry) as Arc<dyn CapabilityRegistry>,
        );

        info!(
            profiles = registry.len(),
            concurrency_limit = config.orchestrator.concurrency_limit,
            "Orchestrator initialized"
        );

        Ok(Self {
            config: config.orchestrator,
            registry,
            rules,
            selector,
            executor,
            store: None,
        })
    }

    /// Persist every execution result to `store`.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish execution events on `monitor`.
    pub fn with_monitor(mut self, monitor: ExecutionMonitor) -> Self {
        self.executor = self.executor.with_monitor(monitor);
        self
    }

    /// Get a reference to the orchestrator settings.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get the shared capability registry.
    pub fn registry(&self) -> Arc<dyn CapabilityRegistry> {
        Arc::clone(&self.registry) as Arc<dyn CapabilityRegistry>
    }

    /// Get a reference to the execution monitor.
    pub fn monitor(&self) -> &ExecutionMonitor {
        self.executor.monitor()
    }

    /// Get a reference to the executor.
    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    /// Rank the registered agents for `request`.
    pub fn select(&self, request: &Request) -> Selection {
        self.selector
            .select(request, self.registry.profiles(), self.config.max_agents)
    }

    /// Select agents and build the plan without running it.
    pub fn plan(
        &self,
        request: &Request,
        input: &serde_json::Value,
    ) -> ConductorResult<(Selection, ExecutionPlan)> {
        let selection = self.select(request);
        let payload = serde_json::json!({
            "request": request.text,
            "phase": selection.phase,
            "input": input,
        });
        let tasks = selection.into_tasks(&payload, &self.rules, self.config.per_task_timeout_seconds);
        let plan = build_plan(tasks)?;
        Ok((selection, plan))
    }

    /// Run the full pipeline for `request`.
    pub async fn run(
        &self,
        request: &Request,
        input: &serde_json::Value,
    ) -> ConductorResult<OrchestrationOutcome> {
        info!(request = %request.text, "Orchestrator: starting pipeline");

        let (selection, plan) = self.plan(request, input)?;
        info!(
            plan_id = %plan.id,
            agents = ?selection.agent_ids(),
            degraded = selection.degraded,
            fallback = selection.fallback,
            "Orchestrator: plan complete"
        );

        let result = self.execute(&plan).await?;

        Ok(OrchestrationOutcome {
            selection,
            plan,
            result,
        })
    }

    /// Execute an already built plan and persist its result.
    pub async fn execute(&self, plan: &ExecutionPlan) -> ConductorResult<ExecutionResult> {
        let result = self.executor.run_plan(plan).await;
        if let Some(store) = &self.store {
            if let Err(e) = store.save_execution(&result).await {
                error!(plan_id = %plan.id, error = %e, "Failed to persist execution result");
                return Err(e);
            }
        }
        Ok(result)
    }

    /// Handoff manager sharing this orchestrator's registry and store.
    pub fn handoff_manager(&self) -> HandoffManager {
        let manager = HandoffManager::from_config(&self.config, self.registry());
        match &self.store {
            Some(store) => manager.with_store(Arc::clone(store)),
            None => manager,
        }
    }

    /// Health monitor using this orchestrator's thresholds.
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::from_config(&self.config)
    }
}
