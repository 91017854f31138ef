//! Rolling statistics over the retained window of finished workflows.
//!
//! The window holds the last `capacity` sessions, matching the registry's
//! retention ring. Evicting a session removes its contribution exactly:
//! counters are integers, and the float averages use the sliding incremental
//! mean with a full recomputation once every `capacity` replacements.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::types::WorkflowStatus;
use crate::workflow::WorkflowExecution;

/// Immutable view of the aggregates at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Bumped on every recorded completion.
    pub version: u64,
    /// Completions recorded since start, including evicted ones.
    pub total_sessions: u64,
    pub retained_sessions: usize,
    pub average_efficiency: f64,
    pub average_duration_secs: f64,
    pub success_rate: f64,
    /// Share of retained sessions each agent took part in.
    pub agent_utilization: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
struct Sample {
    efficiency: f64,
    duration_secs: f64,
    success: bool,
    agents: Vec<String>,
}

impl Sample {
    fn from_workflow(wf: &WorkflowExecution) -> Self {
        Self {
            efficiency: wf.efficiency(),
            duration_secs: wf.duration_secs(),
            success: wf.status == WorkflowStatus::Completed,
            agents: wf.agents().into_iter().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug)]
struct Window {
    capacity: usize,
    samples: VecDeque<Sample>,
    total_sessions: u64,
    avg_efficiency: f64,
    avg_duration: f64,
    successes: usize,
    agent_sessions: HashMap<String, usize>,
    replacements: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.min(4096)),
            total_sessions: 0,
            avg_efficiency: 0.0,
            avg_duration: 0.0,
            successes: 0,
            agent_sessions: HashMap::new(),
            replacements: 0,
        }
    }

    fn add_counts(&mut self, s: &Sample) {
        if s.success {
            self.successes += 1;
        }
        for agent in &s.agents {
            *self.agent_sessions.entry(agent.clone()).or_insert(0) += 1;
        }
    }

    fn remove_counts(&mut self, s: &Sample) {
        if s.success {
            self.successes -= 1;
        }
        for agent in &s.agents {
            if let Some(n) = self.agent_sessions.get_mut(agent) {
                *n -= 1;
                if *n == 0 {
                    self.agent_sessions.remove(agent);
                }
            }
        }
    }

    fn push(&mut self, sample: Sample) {
        self.total_sessions += 1;
        if self.capacity == 0 {
            return;
        }

        if self.samples.len() == self.capacity {
            let Some(old) = self.samples.pop_front() else {
                return;
            };
            let n = self.capacity as f64;
            self.avg_efficiency += (sample.efficiency - old.efficiency) / n;
            self.avg_duration += (sample.duration_secs - old.duration_secs) / n;
            self.remove_counts(&old);
            self.add_counts(&sample);
            self.samples.push_back(sample);
            self.replacements += 1;
            if self.replacements >= self.capacity {
                self.recompute();
            }
        } else {
            let (efficiency, duration) = (sample.efficiency, sample.duration_secs);
            self.add_counts(&sample);
            self.samples.push_back(sample);
            let n = self.samples.len() as f64;
            self.avg_efficiency += (efficiency - self.avg_efficiency) / n;
            self.avg_duration += (duration - self.avg_duration) / n;
        }
    }

    /// Exact means over the retained samples; clears accumulated drift.
    fn recompute(&mut self) {
        let n = self.samples.len();
        if n == 0 {
            self.avg_efficiency = 0.0;
            self.avg_duration = 0.0;
        } else {
            self.avg_efficiency = self.samples.iter().map(|s| s.efficiency).sum::<f64>() / n as f64;
            self.avg_duration = self.samples.iter().map(|s| s.duration_secs).sum::<f64>() / n as f64;
        }
        self.replacements = 0;
    }

    fn metrics(&self) -> AggregateMetrics {
        let n = self.samples.len();
        let ratio = |count: usize| if n == 0 { 0.0 } else { count as f64 / n as f64 };
        AggregateMetrics {
            version: self.total_sessions,
            total_sessions: self.total_sessions,
            retained_sessions: n,
            average_efficiency: self.avg_efficiency,
            average_duration_secs: self.avg_duration,
            success_rate: ratio(self.successes),
            agent_utilization: self
                .agent_sessions
                .iter()
                .map(|(agent, &count)| (agent.clone(), ratio(count)))
                .collect(),
        }
    }
}

/// Maintains [`AggregateMetrics`] incrementally and publishes versioned snapshots.
#[derive(Debug)]
pub struct Aggregator {
    window: Mutex<Window>,
    published: RwLock<Arc<AggregateMetrics>>,
}

impl Aggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(Window::new(capacity)),
            published: RwLock::new(Arc::new(AggregateMetrics::default())),
        }
    }

    /// Fold a finished workflow into the window and publish a fresh snapshot.
    pub fn record_completion(&self, workflow: &WorkflowExecution) {
        let sample = Sample::from_workflow(workflow);
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.push(sample);
        let next = Arc::new(window.metrics());
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Latest published snapshot. Never observes a half-applied update.
    pub fn snapshot(&self) -> Arc<AggregateMetrics> {
        Arc::clone(&self.published.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn per_agent_utilization(&self, agent_name: &str) -> f64 {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .agent_utilization
            .get(agent_name)
            .copied()
            .unwrap_or(0.0)
    }
}
