//! Core error definitions for the Conductor orchestration workspace.
//!
//! Every Conductor crate reports failures through [`ConductorError`]. The
//! variants follow the orchestration error taxonomy: structural errors that
//! block a whole plan, task-level errors that are recorded and isolated, and
//! handoff errors that are terminal for the caller of a single handoff.
//!
//! # Main types
//!
//! - [`ConductorError`]: Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`]: Convenience alias for `Result<T, ConductorError>`.
//! - [`ErrorKind`]: Serializable classification of an error, stored with task results.

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Conductor workspace.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Invalid configuration: bad weights, out-of-range thresholds, duplicate task ids.
    #[error("Config error: {0}")]
    Config(String),

    /// The task set contains a dependency cycle. Carries the ids on the cycle.
    #[error("Config error: dependency cycle detected among tasks [{}]", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// The resource governor could neither admit nor queue a task.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A task exceeded its timeout and was cancelled.
    #[error("Task '{task_id}' timed out after {timeout_secs}s")]
    TimedOut {
        /// Id of the task that expired.
        task_id: String,
        /// Timeout the task was given.
        timeout_secs: u64,
    },

    /// The execution backend reported an error for a task.
    #[error("Execution failure: {0}")]
    Execution(String),

    /// The handoff target lacks capabilities the context requires.
    #[error("Capability mismatch: agent '{target}' lacks [{}]", .missing.join(", "))]
    CapabilityMismatch {
        /// Target agent id.
        target: String,
        /// Required capability tags the target does not declare.
        missing: Vec<String>,
    },

    /// A handoff was rolled back after validation.
    #[error("Handoff failed: {0}")]
    HandoffFailed(String),

    /// An agent id could not be resolved in the capability registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// The context-analysis collaborator could not score a request.
    #[error("Context analysis error: {0}")]
    ContextAnalysis(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Classification of a [`ConductorError`], safe to persist alongside results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Configuration or dependency-graph error.
    Configuration,
    /// Admission was refused.
    ResourceExhausted,
    /// Timeout expiry.
    TimedOut,
    /// Backend failure.
    ExecutionFailure,
    /// Handoff capability check failed.
    CapabilityMismatch,
    /// Handoff rolled back.
    HandoffFailed,
    /// Registry lookup failed.
    Registry,
    /// Context analysis failed.
    ContextAnalysis,
    /// Serialization or I/O.
    Io,
}

impl ConductorError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Config(_) | ConductorError::DependencyCycle(_) => {
                ErrorKind::Configuration
            }
            ConductorError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ConductorError::TimedOut { .. } => ErrorKind::TimedOut,
            ConductorError::Execution(_) => ErrorKind::ExecutionFailure,
            ConductorError::CapabilityMismatch { .. } => ErrorKind::CapabilityMismatch,
            ConductorError::HandoffFailed(_) => ErrorKind::HandoffFailed,
            ConductorError::Registry(_) => ErrorKind::Registry,
            ConductorError::ContextAnalysis(_) => ErrorKind::ContextAnalysis,
            ConductorError::Json(_) | ConductorError::Io(_) => ErrorKind::Io,
        }
    }

    /// Structural errors fail a whole plan before any task runs.
    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_tasks() {
        let err = ConductorError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        let msg = err.to_string();
        assert!(msg.contains("a, b, a"));
        assert!(err.is_structural());
    }

    #[test]
    fn test_capability_mismatch_message() {
        let err = ConductorError::CapabilityMismatch {
            target: "frontend-architecture".into(),
            missing: vec!["sql".into(), "migrations".into()],
        };
        assert_eq!(
            err.to_string(),
            "Capability mismatch: agent 'frontend-architecture' lacks [sql, migrations]"
        );
        assert_eq!(err.kind(), ErrorKind::CapabilityMismatch);
        assert!(!err.is_structural());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
        let parsed: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ConductorError = io.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
