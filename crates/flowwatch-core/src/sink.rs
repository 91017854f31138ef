//! Asynchronous persistence and notification of state changes.
//!
//! `enqueue` only touches an in-memory FIFO and wakes the background writer;
//! all store I/O happens on the writer task (through `spawn_blocking`) or in
//! an explicit `flush`. Entries leave the queue only once persisted or
//! dead-lettered, so a failed flush loses nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::SinkConfig;
use crate::error::{SinkError, StoreError};
use crate::events::{Notification, StateChange};
use crate::store::ChangeStore;

/// An entry that exhausted its persistence attempts.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub change: StateChange,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Queued {
    change: StateChange,
    attempts: u32,
}

struct Shared {
    store: Arc<dyn ChangeStore>,
    config: SinkConfig,
    queue: Mutex<VecDeque<Queued>>,
    next_sequence: AtomicU64,
    wake: Notify,
    /// Held by whoever is draining: the writer loop or `flush`.
    drain: tokio::sync::Mutex<()>,
    dead: Mutex<Vec<DeadLetter>>,
    tx: broadcast::Sender<Notification>,
}

impl Shared {
    fn front(&self) -> Option<Queued> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    fn pop_front(&self, sequence: u64) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.front().map(|q| q.change.sequence) == Some(sequence) {
            queue.pop_front();
        }
    }

    fn bump_attempts(&self, sequence: u64) -> u32 {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.front_mut() {
            Some(q) if q.change.sequence == sequence => {
                q.attempts += 1;
                q.attempts
            }
            _ => 0,
        }
    }

    async fn write(&self, change: &StateChange) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let change = change.clone();
        tokio::task::spawn_blocking(move || store.append(&change))
            .await
            .map_err(|e| StoreError::Backend(format!("store worker failed: {e}")))?
    }

    fn persisted(&self, change: StateChange) {
        self.pop_front(change.sequence);
        debug!(sequence = change.sequence, workflow_id = %change.workflow_id, "persisted change");
        let _ = self.tx.send(Notification::Change(change));
    }

    fn dead_letter(&self, entry: Queued, attempts: u32, error: String) {
        let sequence = entry.change.sequence;
        error!(
            sequence,
            workflow_id = %entry.change.workflow_id,
            attempts,
            error = %error,
            "persistence failed; moved change to dead-letter"
        );
        let notice = Notification::Degraded {
            sequence,
            workflow_id: entry.change.workflow_id.clone(),
            event_type: entry.change.event_type,
            attempts,
            error: error.clone(),
        };
        self.pop_front(sequence);
        self.dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter {
                change: entry.change,
                attempts,
                error,
                failed_at: Utc::now(),
            });
        let _ = self.tx.send(notice);
    }

    /// One writer attempt on the head of the queue. Returns `None` once the
    /// queue is empty, otherwise the delay to wait before the next attempt.
    async fn drain_step(&self) -> Option<Duration> {
        let _guard = self.drain.lock().await;
        let entry = self.front()?;
        let sequence = entry.change.sequence;
        match self.write(&entry.change).await {
            Ok(()) => {
                self.persisted(entry.change);
                Some(Duration::ZERO)
            }
            Err(e) => {
                let attempts = self.bump_attempts(sequence);
                if attempts >= self.config.max_attempts {
                    self.dead_letter(entry, attempts, e.to_string());
                    Some(Duration::ZERO)
                } else {
                    let delay = backoff(&self.config, attempts);
                    warn!(sequence, attempts, error = %e, ?delay, "persistence failed; retrying");
                    Some(delay)
                }
            }
        }
    }

    /// Writer-side drain: retries each entry with backoff and dead-letters on
    /// exhaustion. The drain lock is released while backing off so `flush`
    /// can interleave.
    async fn drain_with_retry(&self) {
        while let Some(delay) = self.drain_step().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `base × 2^(attempt-1)`, capped at `max_backoff_ms`.
fn backoff(config: &SinkConfig, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let ms = config
        .base_backoff_ms
        .saturating_mul(1u64 << exp)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

/// Persistence/notification sink. Create inside a tokio runtime.
pub struct Sink {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Sink {
    /// Start the background writer. Sequence numbers continue after the
    /// highest record already in `store`.
    pub fn start(store: Arc<dyn ChangeStore>, config: SinkConfig) -> Result<Self, StoreError> {
        let last = store.last_sequence()?;
        let (tx, _) = broadcast::channel(config.notify_capacity.max(1));
        let shared = Arc::new(Shared {
            store,
            config,
            queue: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(last + 1),
            wake: Notify::new(),
            drain: tokio::sync::Mutex::new(()),
            dead: Mutex::new(Vec::new()),
            tx,
        });

        let worker = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                worker.wake.notified().await;
                worker.drain_with_retry().await;
            }
        });

        Ok(Self {
            shared,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Queue a change for persistence. Never performs I/O; returns the
    /// assigned sequence number.
    pub fn enqueue(&self, mut change: StateChange) -> u64 {
        let sequence = {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let sequence = self.shared.next_sequence.fetch_add(1, Ordering::Relaxed);
            change.sequence = sequence;
            queue.push_back(Queued {
                change,
                attempts: 0,
            });
            sequence
        };
        self.shared.wake.notify_one();
        sequence
    }

    /// Drain the queue now, one attempt per entry. Stops at the first failure
    /// and returns it; that entry and everything behind it stay queued.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let _guard = self.shared.drain.lock().await;
        while let Some(entry) = self.shared.front() {
            match self.shared.write(&entry.change).await {
                Ok(()) => self.shared.persisted(entry.change),
                Err(source) => {
                    return Err(SinkError::Persist {
                        sequence: entry.change.sequence,
                        workflow_id: entry.change.workflow_id,
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Stop the background writer and flush whatever is left.
    pub async fn shutdown(&self) -> Result<(), SinkError> {
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            // An aborted in-flight write leaves its entry queued; rewriting the
            // same sequence is idempotent.
            let _ = handle.await;
        }
        self.flush().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.shared.tx.subscribe()
    }

    /// Entries waiting to be persisted.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared
            .dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persistence has dropped at least one change into the dead-letter list.
    pub fn is_degraded(&self) -> bool {
        !self
            .shared
            .dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Put dead-lettered changes back on the queue with fresh attempt counts.
    pub fn requeue_dead_letters(&self) -> usize {
        let dead: Vec<DeadLetter> = std::mem::take(
            &mut *self
                .shared
                .dead
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = dead.len();
        if count > 0 {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.extend(dead.into_iter().map(|d| Queued {
                change: d.change,
                attempts: 0,
            }));
        }
        self.shared.wake.notify_one();
        count
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if let Some(handle) = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
