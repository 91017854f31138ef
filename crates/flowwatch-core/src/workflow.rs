//! Workflow, phase, and agent-execution records plus the per-workflow
//! transition rules. Everything here is single-threaded; the registry wraps
//! each workflow in its own lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{MonitorError, Result};
use crate::types::{ExecutionKey, PhaseStatus, WorkflowStatus};

fn secs_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub status: PhaseStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set once both `start_time` and `end_time` are known.
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PhaseStatus::Pending,
            start_time: None,
            end_time: None,
            duration_secs: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn finish(&mut self, status: PhaseStatus, at: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(at);
        self.duration_secs = self.start_time.map(|start| secs_between(start, at));
    }
}

// ---------------------------------------------------------------------------
// AgentExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent_name: String,
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Ran concurrently with sibling executions.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentExecution {
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(&self.agent_name, &self.task_id)
    }

    pub fn is_running(&self) -> bool {
        self.end_time.is_none()
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub user_request: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_phase: Option<String>,
    pub phases: Vec<Phase>,
    pub agent_executions: Vec<AgentExecution>,
    pub progress_percentage: f64,
    /// Start of the current active stretch; `None` while not active.
    #[serde(default)]
    pub active_since: Option<DateTime<Utc>>,
    /// Seconds spent active in stretches that have already ended.
    #[serde(default)]
    pub active_secs: f64,
    /// Latest execution per key, as an offset into `agent_executions`.
    #[serde(skip)]
    execution_index: HashMap<ExecutionKey, usize>,
}

impl WorkflowExecution {
    /// Create a new workflow in `Pending` state with the given ordered phases.
    pub fn new(
        id: impl Into<String>,
        user_request: impl Into<String>,
        phases: impl IntoIterator<Item = String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_request: user_request.into(),
            status: WorkflowStatus::Pending,
            created_at,
            updated_at: created_at,
            current_phase: None,
            phases: phases.into_iter().map(Phase::new).collect(),
            agent_executions: Vec::new(),
            progress_percentage: 0.0,
            active_since: None,
            active_secs: 0.0,
            execution_index: HashMap::new(),
        }
    }

    /// Rebuild the execution index after deserialization.
    pub fn reindex(&mut self) {
        self.execution_index = self
            .agent_executions
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key(), i))
            .collect();
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn execution(&self, key: &ExecutionKey) -> Option<&AgentExecution> {
        self.execution_index
            .get(key)
            .and_then(|&i| self.agent_executions.get(i))
    }

    pub fn execution_keys(&self) -> impl Iterator<Item = &ExecutionKey> {
        self.execution_index.keys()
    }

    /// Distinct agents that ran at least one execution.
    pub fn agents(&self) -> HashSet<&str> {
        self.agent_executions
            .iter()
            .map(|e| e.agent_name.as_str())
            .collect()
    }

    pub fn completed_phases(&self) -> usize {
        self.phases.iter().filter(|p| p.status.is_done()).count()
    }

    /// Share of phases that finished successfully; used as the session efficiency.
    pub fn efficiency(&self) -> f64 {
        if self.phases.is_empty() {
            return if self.status == WorkflowStatus::Completed {
                1.0
            } else {
                0.0
            };
        }
        self.completed_phases() as f64 / self.phases.len() as f64
    }

    pub fn duration_secs(&self) -> f64 {
        secs_between(self.created_at, self.updated_at)
    }

    /// Time spent in `Active` up to `now`, excluding pending and paused stretches.
    pub fn active_running_secs(&self, now: DateTime<Utc>) -> f64 {
        self.active_secs + self.active_since.map_or(0.0, |since| secs_between(since, now))
    }

    /// Switch status and keep the active clock in step with it.
    fn enter(&mut self, next: WorkflowStatus, at: DateTime<Utc>) {
        if self.status == WorkflowStatus::Active && next != WorkflowStatus::Active {
            if let Some(since) = self.active_since.take() {
                self.active_secs += secs_between(since, at);
            }
        } else if next == WorkflowStatus::Active && self.active_since.is_none() {
            self.active_since = Some(at);
        }
        self.status = next;
    }

    fn recompute_progress(&mut self) {
        self.progress_percentage = if self.phases.is_empty() {
            if self.status == WorkflowStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            self.completed_phases() as f64 / self.phases.len() as f64 * 100.0
        };
    }

    fn reject(&self, event: &str, reason: impl Into<String>) -> MonitorError {
        MonitorError::InvalidTransition {
            workflow_id: self.id.clone(),
            from: self.status,
            event: event.to_string(),
            reason: reason.into(),
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    // ---------------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------------

    /// Move the workflow along the status diagram.
    pub fn set_status(&mut self, next: WorkflowStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.reject(
                "status_changed",
                format!("{} -> {next} is not allowed", self.status),
            ));
        }
        self.enter(next, at);
        self.touch(at);
        if next == WorkflowStatus::Completed {
            self.recompute_progress();
        }
        Ok(())
    }

    /// Apply a phase transition. Returns the workflow status afterwards so the
    /// caller can detect completion or failure.
    pub fn apply_phase(
        &mut self,
        name: &str,
        status: PhaseStatus,
        error: Option<String>,
        warnings: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<WorkflowStatus> {
        if self.status != WorkflowStatus::Active {
            return Err(self.reject("phase_changed", "workflow is not active"));
        }
        let Some(idx) = self.phases.iter().position(|p| p.name == name) else {
            return Err(MonitorError::UnknownPhase {
                workflow_id: self.id.clone(),
                phase: name.to_string(),
            });
        };

        let from = self.phases[idx].status;
        let annotation_only = from == PhaseStatus::InProgress && status == PhaseStatus::InProgress;
        if !annotation_only && !from.can_transition_to(status) {
            return Err(MonitorError::InvalidPhaseTransition {
                workflow_id: self.id.clone(),
                phase: name.to_string(),
                from,
                to: status,
            });
        }
        if status == PhaseStatus::InProgress && !annotation_only {
            if let Some(running) = self
                .phases
                .iter()
                .find(|p| p.status == PhaseStatus::InProgress)
            {
                return Err(self.reject(
                    "phase_changed",
                    format!("phase '{}' is already in progress", running.name),
                ));
            }
        }

        let phase = &mut self.phases[idx];
        phase.warnings.extend(warnings);
        match status {
            PhaseStatus::InProgress => {
                if !annotation_only {
                    phase.status = PhaseStatus::InProgress;
                    phase.start_time = Some(at);
                }
                if let Some(e) = error {
                    phase.errors.push(e);
                }
                self.current_phase = Some(name.to_string());
            }
            PhaseStatus::Completed | PhaseStatus::Skipped => {
                if let Some(e) = error {
                    phase.errors.push(e);
                }
                phase.finish(status, at);
                if self.current_phase.as_deref() == Some(name) {
                    self.current_phase = None;
                }
            }
            PhaseStatus::Failed => {
                phase
                    .errors
                    .push(error.unwrap_or_else(|| "phase failed".to_string()));
                phase.finish(status, at);
                if self.current_phase.as_deref() == Some(name) {
                    self.current_phase = None;
                }
            }
            // Nothing transitions back to pending.
            PhaseStatus::Pending => {}
        }

        self.touch(at);
        self.recompute_progress();

        if status == PhaseStatus::Failed {
            self.enter(WorkflowStatus::Failed, at);
        } else if self.phases.iter().all(|p| p.status.is_done()) {
            self.enter(WorkflowStatus::Completed, at);
            self.recompute_progress();
        }
        Ok(self.status)
    }

    /// Record the start of an agent execution.
    pub fn start_execution(
        &mut self,
        key: ExecutionKey,
        parallel: bool,
        at: DateTime<Utc>,
    ) -> Result<&AgentExecution> {
        if !self.status.is_live() {
            return Err(self.reject(
                "agent_execution_started",
                "workflow is not active or paused",
            ));
        }
        if self.execution(&key).is_some_and(AgentExecution::is_running) {
            return Err(MonitorError::DuplicateExecution {
                agent: key.agent_name,
                task: key.task_id,
            });
        }
        self.agent_executions.push(AgentExecution {
            agent_name: key.agent_name.clone(),
            task_id: key.task_id.clone(),
            start_time: at,
            end_time: None,
            duration_secs: None,
            parallel,
            error: None,
        });
        let idx = self.agent_executions.len() - 1;
        self.execution_index.insert(key, idx);
        self.touch(at);
        Ok(&self.agent_executions[idx])
    }

    /// Record the end of a running agent execution.
    pub fn end_execution(
        &mut self,
        key: &ExecutionKey,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<&AgentExecution> {
        if !self.status.is_live() {
            return Err(self.reject(
                "agent_execution_ended",
                "workflow is not active or paused",
            ));
        }
        let idx = match self.execution_index.get(key) {
            Some(&i) if self.agent_executions[i].is_running() => i,
            _ => {
                return Err(MonitorError::DanglingExecution {
                    agent: key.agent_name.clone(),
                    task: key.task_id.clone(),
                })
            }
        };
        let exec = &mut self.agent_executions[idx];
        exec.end_time = Some(at);
        exec.duration_secs = Some(secs_between(exec.start_time, at));
        exec.error = error;
        self.touch(at);
        Ok(&self.agent_executions[idx])
    }

    /// Fail the workflow with `reason` recorded on its current phase (or the
    /// next pending one when nothing is running). `event` names the trigger
    /// in the rejection error.
    pub fn fail_with_error(&mut self, event: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(WorkflowStatus::Failed) {
            return Err(self.reject(
                event,
                format!("{} -> failed is not allowed", self.status),
            ));
        }
        let target = match self.current_phase.as_deref() {
            Some(name) => self.phases.iter().position(|p| p.name == name),
            None => self
                .phases
                .iter()
                .position(|p| p.status == PhaseStatus::Pending),
        };
        if let Some(idx) = target {
            let phase = &mut self.phases[idx];
            phase.errors.push(reason.to_string());
            phase.finish(PhaseStatus::Failed, at);
        }
        self.current_phase = None;
        self.enter(WorkflowStatus::Failed, at);
        self.touch(at);
        self.recompute_progress();
        Ok(())
    }
}
