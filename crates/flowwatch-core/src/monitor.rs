//! The workflow monitor: validates lifecycle events against the state
//! machine, applies them to the registry, folds finished workflows into the
//! metrics window, and hands every accepted transition to the sink.
//!
//! Per accepted event the order is fixed: registry update, aggregator (only
//! when the workflow reaches a terminal status), then `Sink::enqueue`. All
//! three run under the workflow's own lock, so one workflow's changes reach
//! the sink in acceptance order while different workflows never contend.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result, SinkError, StoreError};
use crate::events::{ChangeKind, EventPayload, MonitorEvent, Notification, StateChange};
use crate::metrics::{AggregateMetrics, Aggregator};
use crate::registry::Registry;
use crate::sink::{DeadLetter, Sink};
use crate::store::ChangeStore;
use crate::types::{ExecutionKey, WorkflowStatus};
use crate::workflow::{AgentExecution, WorkflowExecution};

/// Reason recorded on the current phase when the sweeper fails a workflow.
pub const TIMEOUT_ERROR: &str = "workflow timed out";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorHealth {
    /// At least one change exhausted its persistence attempts.
    pub degraded: bool,
    pub dead_letters: usize,
    /// Changes accepted but not yet persisted.
    pub pending: usize,
    pub active_workflows: usize,
    pub retained_workflows: usize,
}

pub struct Monitor {
    config: MonitorConfig,
    registry: Registry,
    aggregator: Aggregator,
    sink: Sink,
    /// Keeps the retention ring and the metrics window in step.
    completion: Mutex<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Build a monitor over `store` and start its background tasks. Must be
    /// called inside a tokio runtime.
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn ChangeStore>,
    ) -> std::result::Result<Arc<Self>, StoreError> {
        let sink = Sink::start(store, config.sink.clone())?;
        let monitor = Arc::new(Self {
            registry: Registry::new(config.retention_capacity),
            aggregator: Aggregator::new(config.retention_capacity),
            sink,
            completion: Mutex::new(()),
            sweeper: Mutex::new(None),
            config,
        });

        let weak = Arc::downgrade(&monitor);
        let period = monitor.config.sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.sweep_timeouts(Utc::now());
            }
        });
        *monitor
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            retention_capacity = monitor.config.retention_capacity,
            workflow_timeout_secs = monitor.config.workflow_timeout_secs,
            "monitor started"
        );
        Ok(monitor)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Validate and apply one event. On success the returned change is
    /// already queued for persistence and carries its sequence number.
    pub fn ingest(&self, event: MonitorEvent) -> Result<StateChange> {
        let workflow_id = event.workflow_id.clone();
        let kind = event.payload.kind();
        let result = self.apply(event);
        match &result {
            Ok(change) => debug!(
                workflow_id = %workflow_id,
                event = %kind,
                sequence = change.sequence,
                "accepted event"
            ),
            Err(e) if e.is_rejection() => warn!(
                workflow_id = %workflow_id,
                event = %kind,
                kind = e.kind(),
                error = %e,
                "rejected event"
            ),
            Err(e) => error!(workflow_id = %workflow_id, event = %kind, error = %e, "event failed"),
        }
        result
    }

    fn apply(&self, event: MonitorEvent) -> Result<StateChange> {
        let MonitorEvent {
            workflow_id,
            timestamp: at,
            payload,
        } = event;
        let kind = payload.kind();

        match payload {
            EventPayload::WorkflowStarted {
                user_request,
                phases,
                deferred,
            } => {
                let mut wf = WorkflowExecution::new(&workflow_id, user_request, phases, at);
                if !deferred {
                    wf.set_status(WorkflowStatus::Active, at)?;
                }
                self.registry.register_with(wf, |wf| {
                    info!(workflow_id = %wf.id, status = %wf.status, phases = wf.phases.len(), "workflow started");
                    let change = StateChange::new(&wf.id, kind, at)
                        .with("user_request", &wf.user_request)
                        .with("status", wf.status)
                        .with(
                            "phases",
                            wf.phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
                        )
                        .with("progress_percentage", wf.progress_percentage);
                    self.commit(change)
                })
            }

            EventPayload::PhaseChanged {
                phase,
                status,
                error,
                warnings,
            } => self.registry.with_workflow(&workflow_id, kind.as_str(), |wf| {
                let before = wf.status;
                let after = wf.apply_phase(&phase, status, error, warnings, at)?;
                let record = wf.phase(&phase);
                let mut change = StateChange::new(&wf.id, kind, at)
                    .with("phase", &phase)
                    .with("phase_status", status)
                    .with("current_phase", &wf.current_phase)
                    .with("progress_percentage", wf.progress_percentage);
                if let Some(p) = record {
                    if !p.errors.is_empty() {
                        change = change.with("errors", &p.errors);
                    }
                    if !p.warnings.is_empty() {
                        change = change.with("warnings", &p.warnings);
                    }
                    if let Some(d) = p.duration_secs {
                        change = change.with("duration_secs", d);
                    }
                }
                if after != before {
                    change = change.with("status", after);
                }
                self.finish_if_terminal(wf)?;
                Ok(self.commit(change))
            }),

            EventPayload::AgentExecutionStarted {
                agent_name,
                task_id,
                parallel,
            } => {
                let key = ExecutionKey::new(agent_name, task_id);
                self.registry.with_workflow(&workflow_id, kind.as_str(), |wf| {
                    let previous = self.registry.claim_execution(&key, &wf.id)?;
                    let started = wf.start_execution(key.clone(), parallel, at).map(|_| ());
                    if let Err(e) = started {
                        self.registry.release_execution(&key, &wf.id, previous);
                        return Err(e);
                    }
                    let change = StateChange::new(&wf.id, kind, at)
                        .with("agent_name", &key.agent_name)
                        .with("task_id", &key.task_id)
                        .with("parallel", parallel)
                        .with("start_time", at);
                    Ok(self.commit(change))
                })
            }

            EventPayload::AgentExecutionEnded {
                agent_name,
                task_id,
                error,
            } => {
                let key = ExecutionKey::new(agent_name, task_id);
                self.registry.with_workflow(&workflow_id, kind.as_str(), |wf| {
                    let id = wf.id.clone();
                    let exec = wf.end_execution(&key, error, at)?;
                    self.registry.finish_execution(&key, &id);
                    let mut change = StateChange::new(id, kind, at)
                        .with("agent_name", &exec.agent_name)
                        .with("task_id", &exec.task_id)
                        .with("end_time", exec.end_time)
                        .with("duration_secs", exec.duration_secs);
                    if let Some(e) = &exec.error {
                        change = change.with("error", e);
                    }
                    Ok(self.commit(change))
                })
            }

            EventPayload::StatusChanged { status, reason } => {
                self.registry.with_workflow(&workflow_id, kind.as_str(), |wf| {
                    let before = wf.status;
                    if status == WorkflowStatus::Failed {
                        let reason = reason.as_deref().unwrap_or("failed by orchestrator");
                        wf.fail_with_error(kind.as_str(), reason, at)?;
                    } else {
                        wf.set_status(status, at)?;
                    }
                    info!(workflow_id = %wf.id, from = %before, to = %status, "workflow status changed");
                    let mut change = StateChange::new(&wf.id, kind, at)
                        .with("status", wf.status)
                        .with("previous_status", before)
                        .with("progress_percentage", wf.progress_percentage);
                    if let Some(r) = &reason {
                        change = change.with("reason", r);
                    }
                    self.finish_if_terminal(wf)?;
                    Ok(self.commit(change))
                })
            }
        }
    }

    /// Record a terminal workflow in the metrics window and the retention
    /// ring together. Called with the workflow's lock held.
    fn finish_if_terminal(&self, wf: &WorkflowExecution) -> Result<()> {
        if !wf.status.is_terminal() {
            return Ok(());
        }
        let _guard = self.completion.lock().unwrap_or_else(PoisonError::into_inner);
        self.aggregator.record_completion(wf);
        let evicted = self.registry.retire(wf)?;
        info!(
            workflow_id = %wf.id,
            status = %wf.status,
            progress = wf.progress_percentage,
            evicted = evicted.len(),
            "workflow finished"
        );
        Ok(())
    }

    fn commit(&self, mut change: StateChange) -> StateChange {
        change.sequence = self.sink.enqueue(change.clone());
        change
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    /// Fail every active workflow whose time spent `Active` exceeds the
    /// configured timeout. Pending and paused stretches do not count.
    /// Returns the ids that were failed.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<String> {
        let limit = self.config.workflow_timeout_secs as f64;
        let mut failed = Vec::new();
        for id in self.registry.active_ids() {
            let outcome = self.registry.with_workflow(&id, ChangeKind::TimedOut.as_str(), |wf| {
                if wf.status != WorkflowStatus::Active || wf.active_running_secs(now) <= limit {
                    return Ok(false);
                }
                let phase = wf.current_phase.clone();
                wf.fail_with_error(ChangeKind::TimedOut.as_str(), TIMEOUT_ERROR, now)?;
                warn!(workflow_id = %wf.id, phase = ?phase, "workflow timed out");
                let change = StateChange::new(&wf.id, ChangeKind::TimedOut, now)
                    .with("status", wf.status)
                    .with("phase", phase)
                    .with("error", TIMEOUT_ERROR)
                    .with("progress_percentage", wf.progress_percentage);
                self.finish_if_terminal(wf)?;
                self.commit(change);
                Ok(true)
            });
            match outcome {
                Ok(true) => failed.push(id),
                Ok(false) => {}
                // Finished between listing and locking.
                Err(MonitorError::WorkflowNotFound(_))
                | Err(MonitorError::InvalidTransition { .. }) => {}
                Err(e) => error!(workflow_id = %id, error = %e, "timeout sweep failed"),
            }
        }
        failed
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_workflow(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        self.registry.get(id)
    }

    pub fn list_active_workflows(&self) -> Vec<WorkflowExecution> {
        self.registry.list_active()
    }

    pub fn list_retained_workflows(&self) -> Vec<WorkflowExecution> {
        self.registry.list_retained()
    }

    pub fn find_execution(
        &self,
        agent_name: &str,
        task_id: &str,
    ) -> Result<Option<AgentExecution>> {
        self.registry.find_execution(agent_name, task_id)
    }

    pub fn get_metrics_snapshot(&self) -> Arc<AggregateMetrics> {
        self.aggregator.snapshot()
    }

    pub fn get_agent_utilization(&self, agent_name: &str) -> f64 {
        self.aggregator.per_agent_utilization(agent_name)
    }

    pub fn health(&self) -> MonitorHealth {
        let dead_letters = self.sink.dead_letters().len();
        MonitorHealth {
            degraded: dead_letters > 0,
            dead_letters,
            pending: self.sink.pending(),
            active_workflows: self.registry.active_count(),
            retained_workflows: self.registry.retained_count(),
        }
    }

    // -----------------------------------------------------------------------
    // Sink passthrough
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sink.subscribe()
    }

    pub async fn flush(&self) -> std::result::Result<(), SinkError> {
        self.sink.flush().await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.sink.dead_letters()
    }

    pub fn requeue_dead_letters(&self) -> usize {
        self.sink.requeue_dead_letters()
    }

    /// Stop the timeout sweeper, then stop the writer and flush what is left.
    pub async fn shutdown(&self) -> std::result::Result<(), SinkError> {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        let result = self.sink.shutdown().await;
        match &result {
            Ok(()) => info!("monitor stopped"),
            Err(e) => error!(error = %e, pending = self.sink.pending(), "final flush failed"),
        }
        result
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
