//! Ingested lifecycle events, the state-change records they produce, and the
//! notifications broadcast to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::types::{PhaseStatus, WorkflowStatus};

// ---------------------------------------------------------------------------
// MonitorEvent
// ---------------------------------------------------------------------------

/// One lifecycle report from the orchestration layer.
///
/// JSON shape: `{ "workflow_id": "...", "timestamp": "...", "type": "phase_changed", ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub workflow_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    WorkflowStarted {
        user_request: String,
        #[serde(default)]
        phases: Vec<String>,
        /// Stay `pending` until an explicit `status_changed → active`.
        #[serde(default)]
        deferred: bool,
    },
    PhaseChanged {
        phase: String,
        status: PhaseStatus,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        warnings: Vec<String>,
    },
    AgentExecutionStarted {
        agent_name: String,
        task_id: String,
        #[serde(default)]
        parallel: bool,
    },
    AgentExecutionEnded {
        agent_name: String,
        task_id: String,
        #[serde(default)]
        error: Option<String>,
    },
    StatusChanged {
        status: WorkflowStatus,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            EventPayload::WorkflowStarted { .. } => ChangeKind::WorkflowStarted,
            EventPayload::PhaseChanged { .. } => ChangeKind::PhaseChanged,
            EventPayload::AgentExecutionStarted { .. } => ChangeKind::AgentExecutionStarted,
            EventPayload::AgentExecutionEnded { .. } => ChangeKind::AgentExecutionEnded,
            EventPayload::StatusChanged { .. } => ChangeKind::StatusChanged,
        }
    }
}

impl MonitorEvent {
    pub fn new(workflow_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn started(
        workflow_id: impl Into<String>,
        user_request: impl Into<String>,
        phases: &[&str],
    ) -> Self {
        Self::new(
            workflow_id,
            EventPayload::WorkflowStarted {
                user_request: user_request.into(),
                phases: phases.iter().map(|p| p.to_string()).collect(),
                deferred: false,
            },
        )
    }

    pub fn phase(workflow_id: impl Into<String>, phase: &str, status: PhaseStatus) -> Self {
        Self::new(
            workflow_id,
            EventPayload::PhaseChanged {
                phase: phase.to_string(),
                status,
                error: None,
                warnings: Vec::new(),
            },
        )
    }

    pub fn execution_started(workflow_id: impl Into<String>, agent: &str, task: &str) -> Self {
        Self::new(
            workflow_id,
            EventPayload::AgentExecutionStarted {
                agent_name: agent.to_string(),
                task_id: task.to_string(),
                parallel: false,
            },
        )
    }

    pub fn execution_ended(workflow_id: impl Into<String>, agent: &str, task: &str) -> Self {
        Self::new(
            workflow_id,
            EventPayload::AgentExecutionEnded {
                agent_name: agent.to_string(),
                task_id: task.to_string(),
                error: None,
            },
        )
    }

    pub fn status(workflow_id: impl Into<String>, status: WorkflowStatus) -> Self {
        Self::new(
            workflow_id,
            EventPayload::StatusChanged {
                status,
                reason: None,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// StateChange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    WorkflowStarted,
    PhaseChanged,
    AgentExecutionStarted,
    AgentExecutionEnded,
    StatusChanged,
    TimedOut,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::WorkflowStarted => "workflow_started",
            ChangeKind::PhaseChanged => "phase_changed",
            ChangeKind::AgentExecutionStarted => "agent_execution_started",
            ChangeKind::AgentExecutionEnded => "agent_execution_ended",
            ChangeKind::StatusChanged => "status_changed",
            ChangeKind::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one accepted transition. Carries only the fields
/// the transition touched, never the whole workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Assigned by the sink on enqueue; zero until then.
    #[serde(default)]
    pub sequence: u64,
    pub workflow_id: String,
    pub event_type: ChangeKind,
    pub timestamp: DateTime<Utc>,
    pub changed_fields: Map<String, Value>,
}

impl StateChange {
    pub fn new(
        workflow_id: impl Into<String>,
        event_type: ChangeKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            workflow_id: workflow_id.into(),
            event_type,
            timestamp,
            changed_fields: Map::new(),
        }
    }

    /// Record a changed field. Values that fail to serialize are stored as null.
    pub fn with(mut self, field: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.changed_fields.insert(field.to_string(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Published to subscribers. `Degraded` signals a monitor health problem and
/// is unrelated to whether any workflow failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Change(StateChange),
    Degraded {
        sequence: u64,
        workflow_id: String,
        event_type: ChangeKind,
        attempts: u32,
        error: String,
    },
}
