use crate::types::{ExecutionResult, HandoffRecord};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Persistence collaborator for plan results and handoff history.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Save the result of a plan, replacing an earlier one with the same id.
    async fn save_execution(&self, result: &ExecutionResult) -> ConductorResult<()>;
    /// Load the result of a plan, if saved.
    async fn load_execution(&self, plan_id: Uuid) -> ConductorResult<Option<ExecutionResult>>;
    /// Ids of all saved plans.
    async fn list_executions(&self) -> ConductorResult<Vec<Uuid>>;
    /// Append one record. Records are never rewritten.
    async fn append_handoff(&self, record: &HandoffRecord) -> ConductorResult<()>;
    /// Records of one conversation in append order.
    async fn handoff_history(&self, conversation_id: Uuid) -> ConductorResult<Vec<HandoffRecord>>;
}

/// File-based store: one pretty JSON file per execution, one JSON-lines
/// file per conversation's handoff history.
pub struct FileResultStore {
    executions: PathBuf,
    handoffs: PathBuf,
}

impl FileResultStore {
    /// Create a new store under `dir`, creating its directories.
    pub async fn new(dir: PathBuf) -> ConductorResult<Self> {
        let executions = dir.join("executions");
        let handoffs = dir.join("handoffs");
        tokio::fs::create_dir_all(&executions).await?;
        tokio::fs::create_dir_all(&handoffs).await?;
        Ok(Self {
            executions,
            handoffs,
        })
    }

    fn execution_path(&self, plan_id: Uuid) -> PathBuf {
        self.executions.join(format!("{plan_id}.json"))
    }

    fn handoff_path(&self, conversation_id: Uuid) -> PathBuf {
        self.handoffs.join(format!("{conversation_id}.jsonl"))
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn save_execution(&self, result: &ExecutionResult) -> ConductorResult<()> {
        let json = serde_json::to_string_pretty(result)?;
        tokio::fs::write(self.execution_path(result.plan_id), json).await?;
        Ok(())
    }

    async fn load_execution(&self, plan_id: Uuid) -> ConductorResult<Option<ExecutionResult>> {
        let path = self.execution_path(plan_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let result = serde_json::from_str(&data).map_err(|e| {
            ConductorError::Execution(format!("Failed to parse execution result: {e}"))
        })?;
        Ok(Some(result))
    }

    async fn list_executions(&self) -> ConductorResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.executions).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(stem) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
            {
                if let Ok(id) = Uuid::parse_str(stem) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn append_handoff(&self, record: &HandoffRecord) -> ConductorResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.handoff_path(record.conversation_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn handoff_history(&self, conversation_id: Uuid) -> ConductorResult<Vec<HandoffRecord>> {
        let path = self.handoff_path(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    ConductorError::HandoffFailed(format!("Failed to parse handoff record: {e}"))
                })
            })
            .collect()
    }
}

/// In-memory store, for tests and short-lived runs.
#[derive(Default)]
pub struct MemoryResultStore {
    executions: Mutex<HashMap<Uuid, ExecutionResult>>,
    handoffs: Mutex<HashMap<Uuid, Vec<HandoffRecord>>>,
}

impl MemoryResultStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save_execution(&self, result: &ExecutionResult) -> ConductorResult<()> {
        self.executions
            .lock()
            .insert(result.plan_id, result.clone());
        Ok(())
    }

    async fn load_execution(&self, plan_id: Uuid) -> ConductorResult<Option<ExecutionResult>> {
        Ok(self.executions.lock().get(&plan_id).cloned())
    }

    async fn list_executions(&self) -> ConductorResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.executions.lock().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_handoff(&self, record: &HandoffRecord) -> ConductorResult<()> {
        self.handoffs
            .lock()
            .entry(record.conversation_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn handoff_history(&self, conversation_id: Uuid) -> ConductorResult<Vec<HandoffRecord>> {
        Ok(self
            .handoffs
            .lock()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
