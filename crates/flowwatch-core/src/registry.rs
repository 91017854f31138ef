//! Indexed in-memory store of active and recently finished workflows.
//!
//! Active workflows sit in a sharded concurrent map, each behind its own
//! mutex, so events for different workflows never contend. Finished
//! workflows move into a fixed-capacity retention ring; the oldest entry is
//! evicted first. A secondary index maps `(agent_name, task_id)` to the
//! owning workflow for O(1) execution lookup, and doubles as the claim that
//! keeps one execution of a pair running at a time across workflows.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::types::ExecutionKey;
use crate::workflow::{AgentExecution, WorkflowExecution};

type Handle = Arc<Mutex<WorkflowExecution>>;

// ---------------------------------------------------------------------------
// Retention ring
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Retained {
    capacity: usize,
    order: VecDeque<String>,
    by_id: HashMap<String, Arc<WorkflowExecution>>,
}

impl Retained {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            by_id: HashMap::new(),
        }
    }

    /// Insert and return whatever fell off the far end.
    fn push(&mut self, wf: Arc<WorkflowExecution>) -> Vec<Arc<WorkflowExecution>> {
        self.order.push_back(wf.id.clone());
        self.by_id.insert(wf.id.clone(), wf);
        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                if let Some(w) = self.by_id.remove(&old) {
                    evicted.push(w);
                }
            }
        }
        evicted
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Latest holder of an `(agent, task)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionClaim {
    pub workflow_id: String,
    /// The holder's execution has not ended yet.
    pub running: bool,
}

#[derive(Debug)]
pub struct Registry {
    active: DashMap<String, Handle>,
    executions: DashMap<ExecutionKey, ExecutionClaim>,
    retained: RwLock<Retained>,
}

impl Registry {
    pub fn new(retention_capacity: usize) -> Self {
        Self {
            active: DashMap::new(),
            executions: DashMap::new(),
            retained: RwLock::new(Retained::new(retention_capacity)),
        }
    }

    fn is_retained(&self, id: &str) -> bool {
        self.retained
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .contains_key(id)
    }

    fn handle(&self, id: &str) -> Option<Handle> {
        self.active.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Insert a new workflow. Ids are unique across active and retained workflows.
    pub fn register(&self, workflow: WorkflowExecution) -> Result<()> {
        self.register_with(workflow, |_| ())
    }

    /// Like [`Registry::register`], running `f` before the workflow becomes
    /// visible to other callers. `f` must not call back into the registry.
    pub fn register_with<R>(
        &self,
        workflow: WorkflowExecution,
        f: impl FnOnce(&WorkflowExecution) -> R,
    ) -> Result<R> {
        match self.active.entry(workflow.id.clone()) {
            Entry::Occupied(_) => Err(MonitorError::DuplicateWorkflow(workflow.id)),
            Entry::Vacant(slot) => {
                if self.is_retained(&workflow.id) {
                    return Err(MonitorError::DuplicateWorkflow(workflow.id));
                }
                let out = f(&workflow);
                debug!(workflow_id = %workflow.id, "registered workflow");
                slot.insert(Arc::new(Mutex::new(workflow)));
                Ok(out)
            }
        }
    }

    /// Copy of the workflow, active or retained. A workflow whose lock was
    /// poisoned by a panicking writer is `Corrupted`, not absent.
    pub fn get(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        if let Some(handle) = self.handle(id) {
            let wf = handle.lock().map_err(|_| {
                warn!(workflow_id = %id, "workflow lock poisoned");
                MonitorError::Corrupted(id.to_string())
            })?;
            return Ok(Some(wf.clone()));
        }
        Ok(self
            .retained
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(id)
            .map(|wf| (**wf).clone()))
    }

    /// Run `f` against an active workflow while holding that workflow's lock.
    ///
    /// Events for a retained (finished) workflow are rejected as invalid
    /// transitions; unknown ids are `WorkflowNotFound`.
    pub fn with_workflow<R>(
        &self,
        id: &str,
        event: &str,
        f: impl FnOnce(&mut WorkflowExecution) -> Result<R>,
    ) -> Result<R> {
        let Some(handle) = self.handle(id) else {
            let retained = self
                .retained
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .by_id
                .get(id)
                .map(|wf| wf.status);
            return Err(match retained {
                Some(status) => MonitorError::InvalidTransition {
                    workflow_id: id.to_string(),
                    from: status,
                    event: event.to_string(),
                    reason: "workflow already finished".to_string(),
                },
                None => MonitorError::WorkflowNotFound(id.to_string()),
            });
        };
        let mut wf = handle
            .lock()
            .map_err(|_| MonitorError::Corrupted(id.to_string()))?;
        f(&mut *wf)
    }

    /// Reserve `key` for a new execution in `workflow_id`.
    ///
    /// Fails with `DuplicateExecution` while another workflow's execution of
    /// the pair is still running; the check and the reservation happen under
    /// one map entry lock. Returns the claim it replaced, which
    /// [`Registry::release_execution`] restores if the start is then refused.
    /// Call with the claiming workflow's lock held.
    pub fn claim_execution(
        &self,
        key: &ExecutionKey,
        workflow_id: &str,
    ) -> Result<Option<ExecutionClaim>> {
        let claim = ExecutionClaim {
            workflow_id: workflow_id.to_string(),
            running: true,
        };
        match self.executions.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.running && current.workflow_id != workflow_id {
                    return Err(MonitorError::DuplicateExecution {
                        agent: key.agent_name.clone(),
                        task: key.task_id.clone(),
                    });
                }
                Ok(Some(slot.insert(claim)))
            }
            Entry::Vacant(slot) => {
                slot.insert(claim);
                Ok(None)
            }
        }
    }

    /// Undo [`Registry::claim_execution`] after the workflow refused the start.
    pub fn release_execution(
        &self,
        key: &ExecutionKey,
        workflow_id: &str,
        previous: Option<ExecutionClaim>,
    ) {
        if let Entry::Occupied(mut slot) = self.executions.entry(key.clone()) {
            if slot.get().workflow_id != workflow_id {
                return;
            }
            match previous {
                Some(claim) => {
                    slot.insert(claim);
                }
                None => {
                    slot.remove();
                }
            }
        }
    }

    /// Mark the claim held by `workflow_id` on `key` as no longer running.
    pub fn finish_execution(&self, key: &ExecutionKey, workflow_id: &str) {
        if let Some(mut claim) = self.executions.get_mut(key) {
            if claim.workflow_id == workflow_id {
                claim.running = false;
            }
        }
    }

    /// Workflow that owns the latest execution for `key`.
    pub fn execution_owner(&self, key: &ExecutionKey) -> Option<String> {
        self.executions.get(key).map(|e| e.value().workflow_id.clone())
    }

    pub fn find_execution(
        &self,
        agent_name: &str,
        task_id: &str,
    ) -> Result<Option<AgentExecution>> {
        let key = ExecutionKey::new(agent_name, task_id);
        let Some(owner) = self.execution_owner(&key) else {
            return Ok(None);
        };
        if let Some(handle) = self.handle(&owner) {
            let wf = handle
                .lock()
                .map_err(|_| MonitorError::Corrupted(owner.clone()))?;
            return Ok(wf.execution(&key).cloned());
        }
        let retained = self.retained.read().unwrap_or_else(PoisonError::into_inner);
        let found = retained
            .by_id
            .get(&owner)
            .and_then(|wf| wf.execution(&key).cloned());
        if found.is_none() {
            warn!(execution = %key, workflow_id = %owner, "execution index points at missing record");
        }
        Ok(found)
    }

    /// Move a finished workflow into the retention ring.
    ///
    /// Returns the workflows evicted to make room (oldest first).
    pub fn mark_completed(&self, id: &str) -> Result<Vec<Arc<WorkflowExecution>>> {
        let handle = self
            .handle(id)
            .ok_or_else(|| MonitorError::WorkflowNotFound(id.to_string()))?;
        let wf = handle
            .lock()
            .map_err(|_| MonitorError::Corrupted(id.to_string()))?;
        self.retire(&wf)
    }

    /// [`Registry::mark_completed`] for a caller already holding the
    /// workflow's lock, i.e. from inside [`Registry::with_workflow`].
    pub fn retire(&self, workflow: &WorkflowExecution) -> Result<Vec<Arc<WorkflowExecution>>> {
        if !workflow.status.is_terminal() {
            return Err(MonitorError::InvalidTransition {
                workflow_id: workflow.id.clone(),
                from: workflow.status,
                event: "mark_completed".to_string(),
                reason: "workflow has not finished".to_string(),
            });
        }
        // Executions left open by a finished workflow can never end.
        for key in workflow.execution_keys() {
            self.finish_execution(key, &workflow.id);
        }
        let evicted = {
            let mut retained = self.retained.write().unwrap_or_else(PoisonError::into_inner);
            retained.push(Arc::new(workflow.clone()))
        };
        for old in &evicted {
            for key in old.execution_keys() {
                self.executions
                    .remove_if(key, |_, claim| claim.workflow_id == old.id);
            }
            debug!(workflow_id = %old.id, "evicted retained workflow");
        }
        self.active.remove(&workflow.id);
        Ok(evicted)
    }

    /// Active and paused workflows ordered by creation time.
    pub fn list_active(&self) -> Vec<WorkflowExecution> {
        let handles: Vec<Handle> = self.active.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out: Vec<WorkflowExecution> = handles
            .iter()
            .filter_map(|h| h.lock().ok().map(|wf| wf.clone()))
            .filter(|wf| wf.status.is_live())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Ids of every workflow not yet retired, including pending ones.
    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Retained workflows, newest first.
    pub fn list_retained(&self) -> Vec<WorkflowExecution> {
        let retained = self.retained.read().unwrap_or_else(PoisonError::into_inner);
        retained
            .order
            .iter()
            .rev()
            .filter_map(|id| retained.by_id.get(id).map(|wf| (**wf).clone()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowStatus;
    use chrono::{Duration, Utc};

    fn workflow(id: &str) -> WorkflowExecution {
        WorkflowExecution::new(id, "req", vec!["only".to_string()], Utc::now())
    }

    fn finish(reg: &Registry, id: &str) -> Vec<Arc<WorkflowExecution>> {
        reg.with_workflow(id, "test", |wf| {
            wf.set_status(WorkflowStatus::Active, Utc::now())?;
            wf.set_status(WorkflowStatus::Completed, Utc::now())
        })
        .unwrap();
        reg.mark_completed(id).unwrap()
    }

    #[test]
    fn register_rejects_duplicates() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        let err = reg.register(workflow("a")).unwrap_err();
        assert!(matches!(err, MonitorError::DuplicateWorkflow(id) if id == "a"));
    }

    #[test]
    fn register_rejects_retained_ids() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        finish(&reg, "a");
        assert!(reg.register(workflow("a")).is_err());
    }

    #[test]
    fn register_with_runs_hook_only_on_success() {
        let reg = Registry::new(4);
        let seen = reg.register_with(workflow("a"), |wf| wf.id.clone()).unwrap();
        assert_eq!(seen, "a");
        let mut called = false;
        assert!(reg.register_with(workflow("a"), |_| called = true).is_err());
        assert!(!called);
    }

    #[test]
    fn retire_from_inside_the_workflow_lock() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        let evicted = reg
            .with_workflow("a", "test", |wf| {
                wf.set_status(WorkflowStatus::Active, Utc::now())?;
                wf.set_status(WorkflowStatus::Cancelled, Utc::now())?;
                reg.retire(wf)
            })
            .unwrap();
        assert!(evicted.is_empty());
        assert_eq!(reg.active_count(), 0);
        assert_eq!(
            reg.get("a").unwrap().unwrap().status,
            WorkflowStatus::Cancelled
        );
    }

    #[test]
    fn get_unknown_is_none() {
        let reg = Registry::new(4);
        assert!(reg.get("ghost").unwrap().is_none());
        assert!(reg.find_execution("coder", "t1").unwrap().is_none());
    }

    #[test]
    fn events_for_retained_workflow_are_invalid_transitions() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        finish(&reg, "a");
        let err = reg.with_workflow("a", "phase_changed", |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        let err = reg.with_workflow("b", "phase_changed", |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), "workflow_not_found");
    }

    #[test]
    fn mark_completed_requires_terminal_status() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        assert!(reg.mark_completed("a").is_err());
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn retention_evicts_oldest_first() {
        let reg = Registry::new(2);
        for id in ["a", "b", "c"] {
            reg.register(workflow(id)).unwrap();
        }
        assert!(finish(&reg, "a").is_empty());
        assert!(finish(&reg, "b").is_empty());
        let evicted = finish(&reg, "c");
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "a");
        assert!(reg.get("a").unwrap().is_none());
        assert!(reg.get("b").unwrap().is_some());
        let ids: Vec<_> = reg.list_retained().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn eviction_drops_execution_index() {
        let reg = Registry::new(1);
        for id in ["a", "b"] {
            reg.register(workflow(id)).unwrap();
            let key = ExecutionKey::new("coder", format!("task-{id}"));
            reg.with_workflow(id, "test", |wf| {
                wf.set_status(WorkflowStatus::Active, Utc::now())?;
                reg.claim_execution(&key, &wf.id)?;
                wf.start_execution(key.clone(), false, Utc::now())?;
                wf.end_execution(&key, None, Utc::now())?;
                wf.set_status(WorkflowStatus::Completed, Utc::now())
            })
            .unwrap();
            reg.mark_completed(id).unwrap();
        }
        assert!(reg.find_execution("coder", "task-a").unwrap().is_none());
        assert!(reg.find_execution("coder", "task-b").unwrap().is_some());
    }

    #[test]
    fn running_claim_blocks_other_workflows() {
        let reg = Registry::new(4);
        let key = ExecutionKey::new("coder", "t1");
        assert_eq!(reg.claim_execution(&key, "a").unwrap(), None);
        let err = reg.claim_execution(&key, "b").unwrap_err();
        assert_eq!(err.kind(), "duplicate_execution");

        reg.finish_execution(&key, "b");
        assert!(reg.claim_execution(&key, "b").is_err());

        reg.finish_execution(&key, "a");
        let previous = reg.claim_execution(&key, "b").unwrap();
        assert_eq!(
            previous,
            Some(ExecutionClaim {
                workflow_id: "a".into(),
                running: false
            })
        );
        assert_eq!(reg.execution_owner(&key).as_deref(), Some("b"));
    }

    #[test]
    fn released_claim_restores_previous_holder() {
        let reg = Registry::new(4);
        let key = ExecutionKey::new("coder", "t1");
        reg.claim_execution(&key, "a").unwrap();
        reg.finish_execution(&key, "a");
        let previous = reg.claim_execution(&key, "b").unwrap();
        reg.release_execution(&key, "b", previous);
        assert_eq!(reg.execution_owner(&key).as_deref(), Some("a"));

        let fresh = ExecutionKey::new("coder", "t2");
        let previous = reg.claim_execution(&fresh, "a").unwrap();
        reg.release_execution(&fresh, "a", previous);
        assert_eq!(reg.execution_owner(&fresh), None);
    }

    #[test]
    fn retiring_a_workflow_frees_its_open_claims() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        let key = ExecutionKey::new("coder", "t1");
        reg.with_workflow("a", "test", |wf| {
            wf.set_status(WorkflowStatus::Active, Utc::now())?;
            reg.claim_execution(&key, &wf.id)?;
            wf.start_execution(key.clone(), false, Utc::now())?;
            wf.set_status(WorkflowStatus::Cancelled, Utc::now())?;
            reg.retire(wf)
        })
        .unwrap();
        assert!(reg.claim_execution(&key, "b").is_ok());
    }

    #[test]
    fn poisoned_workflow_reports_corruption() {
        let reg = Registry::new(4);
        reg.register(workflow("a")).unwrap();
        let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            reg.with_workflow("a", "test", |_| -> Result<()> {
                panic!("writer crashed mid-update")
            })
        }));
        assert!(crashed.is_err());

        let err = reg.get("a").unwrap_err();
        assert!(matches!(err, MonitorError::Corrupted(ref id) if id == "a"));
        assert_eq!(err.kind(), "corrupted");
        assert!(reg.get("ghost").unwrap().is_none());
    }

    #[test]
    fn list_active_orders_by_creation_and_skips_pending() {
        let reg = Registry::new(4);
        let base = Utc::now();
        for (id, offset) in [("late", 10), ("early", 0), ("pending", 5)] {
            reg.register(WorkflowExecution::new(
                id,
                "req",
                Vec::<String>::new(),
                base + Duration::seconds(offset),
            ))
            .unwrap();
        }
        for id in ["late", "early"] {
            reg.with_workflow(id, "test", |wf| {
                wf.set_status(WorkflowStatus::Active, base)
            })
            .unwrap();
        }
        let ids: Vec<_> = reg.list_active().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }
}
