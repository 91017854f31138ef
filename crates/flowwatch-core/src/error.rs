use thiserror::Error;

use crate::types::{PhaseStatus, WorkflowStatus};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already exists: {0}")]
    DuplicateWorkflow(String),

    #[error("invalid transition for workflow {workflow_id} from {from} ({event}): {reason}")]
    InvalidTransition {
        workflow_id: String,
        from: WorkflowStatus,
        event: String,
        reason: String,
    },

    #[error("invalid phase transition for '{phase}' in {workflow_id}: {from} -> {to}")]
    InvalidPhaseTransition {
        workflow_id: String,
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("phase '{phase}' is not declared on workflow {workflow_id}")]
    UnknownPhase { workflow_id: String, phase: String },

    #[error("agent execution already running: {agent}/{task}")]
    DuplicateExecution { agent: String, task: String },

    #[error("no running agent execution for {agent}/{task}")]
    DanglingExecution { agent: String, task: String },

    #[error("internal state corrupted for workflow {0}")]
    Corrupted(String),
}

impl MonitorError {
    /// Stable tag used by the HTTP layer and in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::WorkflowNotFound(_) => "workflow_not_found",
            MonitorError::DuplicateWorkflow(_) => "duplicate_workflow",
            MonitorError::InvalidTransition { .. } => "invalid_transition",
            MonitorError::InvalidPhaseTransition { .. } => "invalid_phase_transition",
            MonitorError::UnknownPhase { .. } => "unknown_phase",
            MonitorError::DuplicateExecution { .. } => "duplicate_execution",
            MonitorError::DanglingExecution { .. } => "dangling_execution",
            MonitorError::Corrupted(_) => "corrupted",
        }
    }

    /// Validation rejections are expected control flow; everything else is a fault.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, MonitorError::Corrupted(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("change store error: {0}")]
    Backend(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to persist change #{sequence} for {workflow_id}: {source}")]
    Persist {
        sequence: u64,
        workflow_id: String,
        #[source]
        source: StoreError,
    },

    #[error("sink writer task failed: {0}")]
    Writer(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
