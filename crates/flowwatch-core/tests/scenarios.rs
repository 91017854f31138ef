//! End-to-end behaviour of the monitor against in-memory and faulty stores.

use chrono::{Duration as ChronoDuration, Utc};
use flowwatch_core::config::{MonitorConfig, SinkConfig};
use flowwatch_core::error::StoreError;
use flowwatch_core::metrics::Aggregator;
use flowwatch_core::registry::Registry;
use flowwatch_core::store::{ChangeStore, MemoryChangeStore};
use flowwatch_core::types::{ExecutionKey, PhaseStatus, WorkflowStatus};
use flowwatch_core::workflow::WorkflowExecution;
use flowwatch_core::{EventPayload, Monitor, MonitorError, MonitorEvent, StateChange};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(retention: usize) -> MonitorConfig {
    MonitorConfig {
        retention_capacity: retention,
        sink: SinkConfig {
            max_attempts: 5,
            base_backoff_ms: 1,
            max_backoff_ms: 10,
            notify_capacity: 1024,
        },
        ..Default::default()
    }
}

fn memory_monitor(retention: usize) -> (Arc<MemoryChangeStore>, Arc<Monitor>) {
    let store = Arc::new(MemoryChangeStore::new());
    let monitor = Monitor::new(config(retention), store.clone()).unwrap();
    (store, monitor)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Fails the first `failures` appends, then delegates.
struct FlakyStore {
    inner: MemoryChangeStore,
    failures: u32,
    calls: AtomicU32,
}

impl ChangeStore for FlakyStore {
    fn append(&self, change: &StateChange) -> Result<(), StoreError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(StoreError::Backend(format!("transient failure {}", n + 1)));
        }
        self.inner.append(change)
    }

    fn list_all(&self) -> Result<Vec<StateChange>, StoreError> {
        self.inner.list_all()
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        self.inner.last_sequence()
    }
}

/// Blocks every append until the gate is released.
#[derive(Default)]
struct StalledStore {
    inner: MemoryChangeStore,
    gate: Mutex<()>,
}

impl ChangeStore for StalledStore {
    fn append(&self, change: &StateChange) -> Result<(), StoreError> {
        let _open = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.append(change)
    }

    fn list_all(&self) -> Result<Vec<StateChange>, StoreError> {
        self.inner.list_all()
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        self.inner.last_sequence()
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_of_three_phases_completes_to_a_third() {
    let (_store, m) = memory_monitor(100);
    m.ingest(MonitorEvent::started("wf-1", "add login", &["design", "build", "review"]))
        .unwrap();
    m.ingest(MonitorEvent::phase("wf-1", "design", PhaseStatus::InProgress))
        .unwrap();
    m.ingest(MonitorEvent::phase("wf-1", "design", PhaseStatus::Completed))
        .unwrap();

    let wf = m.get_workflow("wf-1").unwrap().unwrap();
    assert!((wf.progress_percentage - 33.33).abs() <= 1.0);
    assert_eq!(wf.status, WorkflowStatus::Active);
    assert!(wf.phase("design").unwrap().duration_secs.is_some());
}

#[tokio::test]
async fn duplicate_execution_start_keeps_the_first() {
    let (_store, m) = memory_monitor(100);
    let t0 = Utc::now() - ChronoDuration::seconds(5);
    m.ingest(MonitorEvent::started("wf", "x", &["a"])).unwrap();
    m.ingest(MonitorEvent::execution_started("wf", "coder", "task-1").at(t0))
        .unwrap();

    let err = m
        .ingest(MonitorEvent::execution_started("wf", "coder", "task-1"))
        .unwrap_err();
    assert!(matches!(err, MonitorError::DuplicateExecution { .. }));

    let exec = m.find_execution("coder", "task-1").unwrap().unwrap();
    assert_eq!(exec.start_time, t0);
    assert!(exec.is_running());
    assert_eq!(m.get_workflow("wf").unwrap().unwrap().agent_executions.len(), 1);
}

#[tokio::test]
async fn end_without_start_is_dangling_and_harmless() {
    let (_store, m) = memory_monitor(100);
    m.ingest(MonitorEvent::started("wf", "x", &["a"])).unwrap();
    let before = m.get_workflow("wf").unwrap().unwrap();

    let err = m
        .ingest(MonitorEvent::execution_ended("wf", "ghost", "task-9"))
        .unwrap_err();
    assert!(matches!(err, MonitorError::DanglingExecution { .. }));

    let after = m.get_workflow("wf").unwrap().unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.updated_at, before.updated_at);
    assert!(after.agent_executions.is_empty());
}

#[tokio::test]
async fn seventy_thirty_outcomes_give_seventy_percent_success() {
    let (_store, m) = memory_monitor(1000);
    let mut outcomes: Vec<bool> = (0..1000).map(|i| i < 700).collect();
    let mut rng = StdRng::seed_from_u64(7);
    outcomes.shuffle(&mut rng);

    for (i, success) in outcomes.into_iter().enumerate() {
        let id = format!("wf-{i}");
        m.ingest(MonitorEvent::started(&id, "job", &["only"])).unwrap();
        m.ingest(MonitorEvent::phase(&id, "only", PhaseStatus::InProgress))
            .unwrap();
        let end = if success {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        m.ingest(MonitorEvent::phase(&id, "only", end)).unwrap();
    }

    let snap = m.get_metrics_snapshot();
    assert_eq!(snap.total_sessions, 1000);
    assert!((snap.success_rate - 0.70).abs() <= 0.02);
    assert!((snap.average_efficiency - 0.70).abs() <= 0.02);
}

#[tokio::test]
async fn transient_store_failures_persist_exactly_once() {
    let store = Arc::new(FlakyStore {
        inner: MemoryChangeStore::new(),
        failures: 4,
        calls: AtomicU32::new(0),
    });
    let m = Monitor::new(config(10), store.clone()).unwrap();
    m.ingest(MonitorEvent::started("wf", "x", &[])).unwrap();

    wait_until(|| store.inner.len() == 1).await;
    assert_eq!(store.calls.load(Ordering::SeqCst), 5);
    assert!(m.dead_letters().is_empty());
    assert!(!m.health().degraded);
    assert_eq!(m.health().pending, 0);
    assert_eq!(store.list_all().unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_mark_the_monitor_degraded_not_the_workflow() {
    let store = Arc::new(FlakyStore {
        inner: MemoryChangeStore::new(),
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let m = Monitor::new(config(10), store.clone()).unwrap();
    m.ingest(MonitorEvent::started("wf", "x", &[])).unwrap();

    wait_until(|| m.health().degraded).await;
    assert_eq!(m.dead_letters().len(), 1);
    assert_eq!(m.get_workflow("wf").unwrap().unwrap().status, WorkflowStatus::Active);
}

// ---------------------------------------------------------------------------
// Performance and isolation properties
// ---------------------------------------------------------------------------

fn populated_registry(n: usize) -> Registry {
    let reg = Registry::new(16);
    let now = Utc::now();
    for i in 0..n {
        let id = format!("wf-{i}");
        reg.register(WorkflowExecution::new(&id, "req", vec!["p".to_string()], now))
            .unwrap();
        let key = ExecutionKey::new("coder", format!("task-{i}"));
        reg.with_workflow(&id, "setup", |wf| {
            wf.set_status(WorkflowStatus::Active, now)?;
            reg.claim_execution(&key, &wf.id)?;
            wf.start_execution(key, false, now)?;
            Ok(())
        })
        .unwrap();
    }
    reg
}

fn lookup_ns(reg: &Registry, n: usize) -> f64 {
    const LOOKUPS: usize = 20_000;
    let ids: Vec<(String, String)> = (0..LOOKUPS)
        .map(|i| (format!("wf-{}", i % n), format!("task-{}", (i * 7) % n)))
        .collect();
    let start = Instant::now();
    for (id, task) in &ids {
        assert!(reg.get(id).unwrap().is_some());
        assert!(reg.find_execution("coder", task).unwrap().is_some());
    }
    start.elapsed().as_nanos() as f64 / LOOKUPS as f64
}

#[test]
fn lookups_do_not_scale_with_workflow_count() {
    let small = populated_registry(100);
    let large = populated_registry(20_000);
    // Warm up allocator and caches.
    lookup_ns(&small, 100);
    lookup_ns(&large, 20_000);

    let small_ns = lookup_ns(&small, 100);
    let large_ns = lookup_ns(&large, 20_000);
    assert!(
        large_ns < small_ns * 10.0 + 5_000.0,
        "lookup cost grew from {small_ns:.0}ns to {large_ns:.0}ns"
    );
}

#[tokio::test]
async fn enqueue_stays_fast_while_the_store_is_stalled() {
    let store = Arc::new(StalledStore::default());
    let m = Monitor::new(config(10), store.clone()).unwrap();
    let gate = store.gate.lock().unwrap();

    let start = Instant::now();
    for i in 0..2_000 {
        m.ingest(MonitorEvent::started(format!("wf-{i}"), "x", &[]))
            .unwrap();
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "2000 ingests took {elapsed:?} with a stalled store"
    );
    assert!(m.health().pending >= 1_999);

    drop(gate);
    m.flush().await.unwrap();
    assert_eq!(store.inner.len(), 2_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eviction_never_touches_live_workflows() {
    let (_store, m) = memory_monitor(2);
    for i in 0..5 {
        m.ingest(MonitorEvent::started(format!("live-{i}"), "x", &["p"]))
            .unwrap();
    }

    let finisher = {
        let m = Arc::clone(&m);
        std::thread::spawn(move || {
            for i in 0..200 {
                let id = format!("done-{i}");
                m.ingest(MonitorEvent::started(&id, "x", &[])).unwrap();
                m.ingest(MonitorEvent::status(&id, WorkflowStatus::Completed))
                    .unwrap();
            }
        })
    };

    while !finisher.is_finished() {
        let live = m
            .list_active_workflows()
            .into_iter()
            .filter(|w| w.id.starts_with("live-"))
            .count();
        assert_eq!(live, 5);
    }
    finisher.join().unwrap();

    assert_eq!(m.list_active_workflows().len(), 5);
    assert_eq!(m.health().retained_workflows, 2);
    assert_eq!(m.get_metrics_snapshot().retained_sessions, 2);
    assert_eq!(m.get_metrics_snapshot().total_sessions, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_starts_of_one_execution_admit_exactly_one() {
    const ROUNDS: usize = 2_000;
    let (_store, m) = memory_monitor(16);
    for id in ["left", "right"] {
        m.ingest(MonitorEvent::started(id, "x", &[])).unwrap();
    }

    let barrier = Arc::new(Barrier::new(2));
    let racer = |workflow: &'static str| {
        let m = Arc::clone(&m);
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            (0..ROUNDS)
                .map(|round| {
                    let task = format!("task-{round}");
                    barrier.wait();
                    m.ingest(MonitorEvent::execution_started(workflow, "coder", &task))
                        .is_ok()
                })
                .collect::<Vec<bool>>()
        })
    };
    let left = racer("left");
    let right = racer("right");
    let left = left.join().unwrap();
    let right = right.join().unwrap();

    for round in 0..ROUNDS {
        assert!(
            left[round] != right[round],
            "round {round}: left accepted={} right accepted={}",
            left[round],
            right[round]
        );
    }
    let running = m
        .list_active_workflows()
        .iter()
        .map(|w| w.agent_executions.len())
        .sum::<usize>();
    assert_eq!(running, ROUNDS);
}

/// A finished workflow whose efficiency is `done / 10`.
fn finished_with(done: usize, duration_secs: i64) -> WorkflowExecution {
    let start = Utc::now();
    let end = start + ChronoDuration::seconds(duration_secs);
    let names: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();
    let mut wf = WorkflowExecution::new("wf", "req", names.clone(), start);
    wf.set_status(WorkflowStatus::Active, start).unwrap();
    for name in names.iter().take(done) {
        wf.apply_phase(name, PhaseStatus::InProgress, None, vec![], start)
            .unwrap();
        wf.apply_phase(name, PhaseStatus::Completed, None, vec![], end)
            .unwrap();
    }
    if done < names.len() {
        wf.apply_phase(&names[done], PhaseStatus::InProgress, None, vec![], start)
            .unwrap();
        wf.apply_phase(&names[done], PhaseStatus::Failed, None, vec![], end)
            .unwrap();
    }
    wf
}

#[test]
fn windowed_average_stays_exact_over_ten_thousand_completions() {
    const WINDOW: usize = 1000;
    let agg = Aggregator::new(WINDOW);
    let mut rng = StdRng::seed_from_u64(42);
    let mut history = Vec::with_capacity(10_000);

    for _ in 0..10_000 {
        let done = rng.gen_range(0..=10);
        let secs = rng.gen_range(1..3_600);
        let wf = finished_with(done, secs);
        history.push((wf.efficiency(), wf.duration_secs()));
        agg.record_completion(&wf);
    }

    let window = &history[history.len() - WINDOW..];
    let exact_eff = window.iter().map(|(e, _)| e).sum::<f64>() / WINDOW as f64;
    let exact_dur = window.iter().map(|(_, d)| d).sum::<f64>() / WINDOW as f64;
    let snap = agg.snapshot();
    assert_eq!(snap.total_sessions, 10_000);
    assert!((snap.average_efficiency - exact_eff).abs() <= 1e-6 * exact_eff.max(1.0));
    assert!((snap.average_duration_secs - exact_dur).abs() <= 1e-6 * exact_dur.max(1.0));
}

// ---------------------------------------------------------------------------
// State machine property
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Status(WorkflowStatus),
    Phase(usize, PhaseStatus),
    Start(u8),
    End(u8),
    Timeout,
}

fn arb_workflow_status() -> impl Strategy<Value = WorkflowStatus> {
    prop::sample::select(WorkflowStatus::all().to_vec())
}

fn arb_phase_status() -> impl Strategy<Value = PhaseStatus> {
    prop_oneof![
        Just(PhaseStatus::Pending),
        Just(PhaseStatus::InProgress),
        Just(PhaseStatus::Completed),
        Just(PhaseStatus::Failed),
        Just(PhaseStatus::Skipped),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        arb_workflow_status().prop_map(Op::Status),
        (0usize..4, arb_phase_status()).prop_map(|(i, s)| Op::Phase(i, s)),
        (0u8..3).prop_map(Op::Start),
        (0u8..3).prop_map(Op::End),
        Just(Op::Timeout),
    ]
}

proptest! {
    /// Whatever events arrive, the workflow only moves along permitted edges
    /// and a rejected event leaves it untouched.
    #[test]
    fn status_only_follows_the_diagram(ops in prop::collection::vec(arb_op(), 1..40)) {
        let t = Utc::now();
        let names: Vec<String> = (0..3).map(|i| format!("p{i}")).collect();
        let mut wf = WorkflowExecution::new("wf", "req", names.clone(), t);

        for op in ops {
            let before = wf.clone();
            let result = match op {
                Op::Status(s) => wf.set_status(s, t),
                Op::Phase(i, s) => {
                    // Index 3 names an undeclared phase.
                    let name = names.get(i).cloned().unwrap_or_else(|| "ghost".to_string());
                    wf.apply_phase(&name, s, None, vec![], t).map(|_| ())
                }
                Op::Start(n) => wf
                    .start_execution(ExecutionKey::new("agent", n.to_string()), false, t)
                    .map(|_| ()),
                Op::End(n) => wf
                    .end_execution(&ExecutionKey::new("agent", n.to_string()), None, t)
                    .map(|_| ()),
                Op::Timeout => wf.fail_with_error("timed_out", "timed out", t),
            };

            match result {
                Ok(()) => {
                    prop_assert!(
                        wf.status == before.status || before.status.can_transition_to(wf.status),
                        "{} -> {} is not an edge", before.status, wf.status
                    );
                }
                Err(_) => {
                    prop_assert_eq!(&wf, &before);
                }
            }
            if before.status.is_terminal() {
                prop_assert_eq!(&wf, &before);
            }
            let in_progress = wf.phases.iter().filter(|p| p.status == PhaseStatus::InProgress).count();
            prop_assert!(in_progress <= 1);
            prop_assert!((0.0..=100.0).contains(&wf.progress_percentage));
        }
    }
}

#[tokio::test]
async fn status_changed_event_round_trips_through_json() {
    let (_store, m) = memory_monitor(10);
    m.ingest(MonitorEvent::started("wf", "x", &[])).unwrap();
    let ev: MonitorEvent = serde_json::from_str(
        r#"{"workflow_id":"wf","type":"status_changed","status":"paused","reason":"operator"}"#,
    )
    .unwrap();
    assert!(matches!(ev.payload, EventPayload::StatusChanged { .. }));
    let change = m.ingest(ev).unwrap();
    assert_eq!(change.changed_fields["status"], "paused");
    assert_eq!(change.changed_fields["reason"], "operator");
}
