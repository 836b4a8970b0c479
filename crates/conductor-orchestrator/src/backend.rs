use crate::profiles::CapabilityRegistry;
use crate::types::AgentId;
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs one agent invocation on behalf of the executor.
///
/// Implementations must watch `cancel` and return promptly once it fires;
/// the executor waits only a short grace period after cancelling.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Run `agent_id` on `input` and return its output.
    async fn invoke(
        &self,
        agent_id: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> ConductorResult<Value>;
}

/// A concrete specialized agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Agent id, matching its capability profile.
    fn id(&self) -> &str;

    /// Capability tags this agent needs its profile to declare.
    fn required_capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle one invocation. Must return promptly once `cancel` fires.
    async fn invoke(&self, input: Value, cancel: CancellationToken) -> ConductorResult<Value>;
}

/// Registry of agents that dispatches invocations by agent id.
#[derive(Default)]
pub struct AgentPool {
    agents: HashMap<AgentId, Arc<dyn Agent>>,
}

impl AgentPool {
    /// Create a new empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent`, replacing one with the same id.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        info!(agent = %id, "Registered agent");
        self.agents.insert(id, agent);
    }

    /// Register `agent` after checking its profile covers what it requires.
    pub fn register_checked(
        &mut self,
        agent: Arc<dyn Agent>,
        registry: &dyn CapabilityRegistry,
    ) -> ConductorResult<()> {
        let profile = registry.lookup(agent.id()).ok_or_else(|| {
            ConductorError::Registry(format!("no profile for agent '{}'", agent.id()))
        })?;
        let required = agent.required_capabilities();
        let missing = profile.missing_capabilities(&required);
        if !missing.is_empty() {
            return Err(ConductorError::CapabilityMismatch {
                target: agent.id().to_string(),
                missing,
            });
        }
        self.register(agent);
        Ok(())
    }

    /// Get a registered agent by id.
    pub fn get(&self, agent_id: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.get(agent_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// True when no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentBackend for AgentPool {
    async fn invoke(
        &self,
        agent_id: &str,
        input: Value,
        cancel: CancellationToken,
    ) -> ConductorResult<Value> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| ConductorError::Registry(format!("Unknown agent: {agent_id}")))?;
        debug!(agent = %agent_id, "Dispatching agent invocation");
        agent.invoke(input, cancel).await
    }
}

/// Agent that answers with its own id and the input it received.
///
/// Used by the CLI `run` command and in tests.
#[derive(Debug, Clone)]
pub struct EchoAgent {
    id: AgentId,
    delay: Duration,
}

impl EchoAgent {
    /// Create a new echo agent that answers immediately.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
        }
    }

    /// Wait `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, input: Value, cancel: CancellationToken) -> ConductorResult<Value> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ConductorError::Execution(format!(
                "agent '{}' cancelled",
                self.id
            ))),
            _ = tokio::time::sleep(self.delay) => Ok(serde_json::json!({
                "agent": self.id,
                "input": input,
            })),
        }
    }
}

/// Pool with one [`EchoAgent`] per registered profile.
pub fn echo_pool(registry: &dyn CapabilityRegistry, delay: Duration) -> AgentPool {
    let mut pool = AgentPool::new();
    for profile in registry.profiles() {
        pool.register(Arc::new(EchoAgent::new(profile.id.clone()).with_delay(delay)));
    }
    pool
}
