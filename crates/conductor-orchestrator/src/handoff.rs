use crate::config::OrchestratorConfig;
use crate::profiles::CapabilityRegistry;
use crate::store::ResultStore;
use crate::types::{AgentProfile, HandoffOutcome, HandoffRecord};
use chrono::Utc;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Characters of serialized JSON per estimated token.
const CHARS_PER_TOKEN: usize = 4;

/// Stages of the handoff protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStage {
    /// The attempt was opened.
    Initiated,
    /// Salient fields were selected and fitted to the target budget.
    ContextPrepared,
    /// The target declares every required capability.
    CapabilityValidated,
    /// The payload for the target was built.
    ContextTransferred,
    /// Retention cleared the threshold.
    Validated,
    /// The record was appended as committed.
    Committed,
    /// The attempt failed and nothing was handed over.
    RolledBack,
}

impl HandoffStage {
    /// True for `Committed` and `RolledBack`.
    pub fn is_terminal(self) -> bool {
        matches!(self, HandoffStage::Committed | HandoffStage::RolledBack)
    }

    fn successor(self) -> Option<HandoffStage> {
        match self {
            HandoffStage::Initiated => Some(HandoffStage::ContextPrepared),
            HandoffStage::ContextPrepared => Some(HandoffStage::CapabilityValidated),
            HandoffStage::CapabilityValidated => Some(HandoffStage::ContextTransferred),
            HandoffStage::ContextTransferred => Some(HandoffStage::Validated),
            HandoffStage::Validated => Some(HandoffStage::Committed),
            HandoffStage::Committed | HandoffStage::RolledBack => None,
        }
    }

    /// Only the next forward stage, or a rollback from a non-terminal stage.
    pub fn can_transition_to(self, next: HandoffStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == HandoffStage::RolledBack || self.successor() == Some(next)
    }
}

/// Context handed from one agent to another.
///
/// Fields keep their declaration order; it decides which fields survive
/// when the target's input budget is too small for all of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffContext {
    fields: Vec<(String, Value)>,
    transient: BTreeSet<String>,
    required_capabilities: BTreeSet<String>,
}

impl HandoffContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. A field with the same name is replaced in place.
    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    /// Add a field that is never handed over.
    pub fn transient_field(mut self, name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        self.transient.insert(name.clone());
        self.field(name, value)
    }

    /// Capability the target agent must declare.
    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities
            .insert(capability.into().to_lowercase());
        self
    }

    /// Build from a JSON object. Fields take the map's iteration order,
    /// which is by key since serde_json is built without `preserve_order`.
    /// Use [`field`](Self::field) when declaration order matters.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            fields: map.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Whether `name` is dropped on handoff: `_`-prefixed or declared transient.
    pub fn is_transient(&self, name: &str) -> bool {
        name.starts_with('_') || self.transient.contains(name)
    }

    /// Names of the fields that should survive a handoff.
    pub fn salient_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .map(|(n, _)| n.as_str())
            .filter(|n| !self.is_transient(n))
            .collect()
    }

    /// Capabilities the target must declare.
    pub fn required_capabilities(&self) -> &BTreeSet<String> {
        &self.required_capabilities
    }

    /// Number of fields, transient ones included.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the context has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Estimated token cost of one `"name":value` entry.
pub fn estimate_tokens(name: &str, value: &Value) -> usize {
    let serialized = value.to_string();
    (name.len() + serialized.len() + 3).div_ceil(CHARS_PER_TOKEN)
}

/// Fraction of `salient` fields present and non-null in `payload`.
///
/// 1.0 when there is nothing salient to retain.
pub fn retention_score(salient: &[&str], payload: &Map<String, Value>) -> f64 {
    if salient.is_empty() {
        return 1.0;
    }
    let kept = salient
        .iter()
        .filter(|name| payload.get(**name).is_some_and(|v| !v.is_null()))
        .count();
    kept as f64 / salient.len() as f64
}

/// Outcome of a committed handoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffResult {
    /// Record appended to the conversation history.
    pub record: HandoffRecord,
    /// Payload shaped for the target agent.
    pub payload: Value,
    /// Stages walked, ending with `Committed`.
    pub stages: Vec<HandoffStage>,
}

/// Aggregate statistics over recorded handoffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffStats {
    /// Recorded handoffs.
    pub total: usize,
    /// Committed handoffs.
    pub committed: usize,
    /// Rolled-back handoffs.
    pub rolled_back: usize,
    /// `committed / total`, 0 when empty.
    pub success_rate: f64,
    /// Mean retention score, 0 when empty.
    pub average_retention: f64,
}

impl HandoffStats {
    fn from_records<'a>(records: impl IntoIterator<Item = &'a HandoffRecord>) -> Self {
        let mut stats = HandoffStats::default();
        let mut retention_sum = 0.0;
        for record in records {
            stats.total += 1;
            retention_sum += record.retention_score;
            match record.outcome {
                HandoffOutcome::Committed => stats.committed += 1,
                HandoffOutcome::RolledBack => stats.rolled_back += 1,
            }
        }
        if stats.total > 0 {
            stats.success_rate = stats.committed as f64 / stats.total as f64;
            stats.average_retention = retention_sum / stats.total as f64;
        }
        stats
    }
}

type History = Arc<tokio::sync::Mutex<Vec<HandoffRecord>>>;

/// One in-flight handoff attempt.
struct Attempt {
    stages: Vec<HandoffStage>,
    retention: f64,
}

impl Attempt {
    fn new() -> Self {
        Self {
            stages: vec![HandoffStage::Initiated],
            retention: 0.0,
        }
    }

    fn stage(&self) -> HandoffStage {
        self.stages
            .last()
            .copied()
            .unwrap_or(HandoffStage::Initiated)
    }

    fn advance(&mut self, next: HandoffStage) -> ConductorResult<()> {
        let current = self.stage();
        if !current.can_transition_to(next) {
            return Err(ConductorError::HandoffFailed(format!(
                "illegal stage transition {current:?} -> {next:?}"
            )));
        }
        self.stages.push(next);
        Ok(())
    }
}

/// Runs the handoff protocol and keeps per-conversation history.
///
/// Handoffs of one conversation are serialized; different conversations
/// proceed independently.
pub struct HandoffManager {
    registry: Arc<dyn CapabilityRegistry>,
    retention_threshold: f64,
    histories: Mutex<HashMap<Uuid, History>>,
    store: Option<Arc<dyn ResultStore>>,
}

impl HandoffManager {
    /// Create a new manager with no history.
    pub fn new(registry: Arc<dyn CapabilityRegistry>, retention_threshold: f64) -> Self {
        Self {
            registry,
            retention_threshold,
            histories: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Create a new manager using the configured retention threshold.
    pub fn from_config(config: &OrchestratorConfig, registry: Arc<dyn CapabilityRegistry>) -> Self {
        Self::new(registry, config.retention_threshold)
    }

    /// Forward every record to `store` as well.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Minimum retention score for a commit.
    pub fn retention_threshold(&self) -> f64 {
        self.retention_threshold
    }

    /// Hand `context` from `source` to `target` within a conversation.
    ///
    /// Exactly one record is appended per call: `Committed` on success,
    /// `RolledBack` with the reason and an empty snapshot otherwise.
    pub async fn execute_handoff(
        &self,
        conversation_id: Uuid,
        source: &str,
        target: &str,
        context: HandoffContext,
    ) -> ConductorResult<HandoffResult> {
        let history = self.history_for(conversation_id);
        let mut history = history.lock().await;

        let id = Uuid::new_v4();
        info!(
            handoff_id = %id,
            conversation_id = %conversation_id,
            source = %source,
            target = %target,
            "Handoff initiated"
        );

        let mut attempt = Attempt::new();
        match self.run_stages(&mut attempt, source, target, &context) {
            Ok((snapshot, payload)) => {
                attempt.advance(HandoffStage::Committed)?;
                let record = HandoffRecord {
                    id,
                    conversation_id,
                    source_agent_id: source.to_string(),
                    target_agent_id: target.to_string(),
                    context_snapshot: snapshot,
                    retention_score: attempt.retention,
                    outcome: HandoffOutcome::Committed,
                    reason: None,
                    timestamp: Utc::now(),
                };
                info!(
                    handoff_id = %id,
                    retention = attempt.retention,
                    fields = record.context_snapshot.len(),
                    "Handoff committed"
                );
                self.persist(&record).await;
                history.push(record.clone());
                Ok(HandoffResult {
                    record,
                    payload,
                    stages: attempt.stages,
                })
            }
            Err(err) => {
                let failed_at = attempt.stage();
                attempt.stages.push(HandoffStage::RolledBack);
                warn!(
                    handoff_id = %id,
                    stage = ?failed_at,
                    error = %err,
                    "Handoff rolled back"
                );
                let record = HandoffRecord {
                    id,
                    conversation_id,
                    source_agent_id: source.to_string(),
                    target_agent_id: target.to_string(),
                    context_snapshot: Map::new(),
                    retention_score: attempt.retention,
                    outcome: HandoffOutcome::RolledBack,
                    reason: Some(err.to_string()),
                    timestamp: Utc::now(),
                };
                self.persist(&record).await;
                history.push(record);
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        attempt: &mut Attempt,
        source: &str,
        target: &str,
        context: &HandoffContext,
    ) -> ConductorResult<(Map<String, Value>, Value)> {
        self.registry
            .lookup(source)
            .ok_or_else(|| ConductorError::Registry(format!("Unknown source agent: {source}")))?;
        let profile = self
            .registry
            .lookup(target)
            .ok_or_else(|| ConductorError::Registry(format!("Unknown target agent: {target}")))?;

        let snapshot = prepare_context(context, profile);
        attempt.advance(HandoffStage::ContextPrepared)?;

        let missing = profile.missing_capabilities(context.required_capabilities());
        if !missing.is_empty() {
            return Err(ConductorError::CapabilityMismatch {
                target: target.to_string(),
                missing,
            });
        }
        attempt.advance(HandoffStage::CapabilityValidated)?;

        let payload = target_payload(source, profile, &snapshot);
        attempt.advance(HandoffStage::ContextTransferred)?;

        let empty = Map::new();
        let transferred = payload
            .get("context")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        attempt.retention = retention_score(&context.salient_fields(), transferred);
        if attempt.retention < self.retention_threshold {
            return Err(ConductorError::HandoffFailed(format!(
                "context retention {:.2} below threshold {:.2}",
                attempt.retention, self.retention_threshold
            )));
        }
        attempt.advance(HandoffStage::Validated)?;

        Ok((snapshot, payload))
    }

    async fn persist(&self, record: &HandoffRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_handoff(record).await {
                error!(handoff_id = %record.id, error = %e, "Failed to persist handoff record");
            }
        }
    }

    fn history_for(&self, conversation_id: Uuid) -> History {
        Arc::clone(self.histories.lock().entry(conversation_id).or_default())
    }

    /// Records of one conversation in append order.
    pub async fn history(&self, conversation_id: Uuid) -> Vec<HandoffRecord> {
        let history = self.histories.lock().get(&conversation_id).cloned();
        match history {
            Some(history) => history.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Statistics of one conversation.
    pub async fn conversation_stats(&self, conversation_id: Uuid) -> HandoffStats {
        HandoffStats::from_records(&self.history(conversation_id).await)
    }

    /// Drop the in-memory history of a finished conversation and return it.
    ///
    /// Waits for a handoff of that conversation that is still running. A
    /// later handoff starts a fresh history. Records already forwarded to
    /// the store are kept there.
    pub async fn end_conversation(&self, conversation_id: Uuid) -> Vec<HandoffRecord> {
        let history = self.histories.lock().remove(&conversation_id);
        let Some(history) = history else {
            return Vec::new();
        };
        let records = std::mem::take(&mut *history.lock().await);
        debug!(
            conversation_id = %conversation_id,
            records = records.len(),
            "Conversation history released"
        );
        records
    }

    /// Number of conversations with in-memory history.
    pub fn conversation_count(&self) -> usize {
        self.histories.lock().len()
    }

    /// Statistics across every conversation.
    pub async fn stats(&self) -> HandoffStats {
        let histories: Vec<History> = self.histories.lock().values().cloned().collect();
        let mut records = Vec::new();
        for history in histories {
            records.extend(history.lock().await.iter().cloned());
        }
        HandoffStats::from_records(&records)
    }
}

/// Salient fields in declaration order, stopping at the first one that
/// does not fit the target's input budget.
fn prepare_context(context: &HandoffContext, target: &AgentProfile) -> Map<String, Value> {
    let mut snapshot = Map::new();
    let mut used = 0usize;
    for (name, value) in &context.fields {
        if context.is_transient(name) {
            continue;
        }
        let cost = estimate_tokens(name, value);
        if used + cost > target.max_input_tokens {
            debug!(
                field = %name,
                budget = target.max_input_tokens,
                used,
                "Context truncated to fit target input budget"
            );
            break;
        }
        used += cost;
        snapshot.insert(name.clone(), value.clone());
    }
    snapshot
}

fn target_payload(source: &str, target: &AgentProfile, snapshot: &Map<String, Value>) -> Value {
    serde_json::json!({
        "handoff_from": source,
        "target_agent": target.id,
        "context": snapshot,
    })
}
