//! Durable, append-only storage for state-change records.
//!
//! # Table design
//!
//! A single `CHANGES` table keyed by the sink-assigned sequence number:
//! ```text
//! sequence: u64  ->  JSON-encoded StateChange
//! ```
//!
//! Keys are ordered, so a full scan replays records in enqueue order. Writing
//! the same sequence twice overwrites the record, which makes retried writes
//! idempotent.

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::error::StoreError;
use crate::events::StateChange;

const CHANGES: TableDefinition<u64, &[u8]> = TableDefinition::new("changes");

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Where the sink writes records. Implementations are called from a blocking
/// worker thread, never from the event path.
pub trait ChangeStore: Send + Sync {
    /// Persist `change` under its sequence number.
    fn append(&self, change: &StateChange) -> Result<(), StoreError>;

    /// Every record in sequence order.
    fn list_all(&self) -> Result<Vec<StateChange>, StoreError>;

    /// Records for one workflow in sequence order.
    fn list_for(&self, workflow_id: &str) -> Result<Vec<StateChange>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|c| c.workflow_id == workflow_id)
            .collect())
    }

    /// Highest persisted sequence, or 0 for an empty store.
    fn last_sequence(&self) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// RedbChangeStore
// ---------------------------------------------------------------------------

pub struct RedbChangeStore {
    db: Database,
}

impl RedbChangeStore {
    /// Open or create the redb database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(CHANGES).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CHANGES).map_err(db_err)?;
        table.len().map_err(db_err)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl ChangeStore for RedbChangeStore {
    fn append(&self, change: &StateChange) -> Result<(), StoreError> {
        let value = serde_json::to_vec(change)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(CHANGES).map_err(db_err)?;
            table
                .insert(change.sequence, value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<StateChange>, StoreError> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CHANGES).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CHANGES).map_err(db_err)?;
        let seq = table
            .last()
            .map_err(db_err)?
            .map(|(k, _)| k.value())
            .unwrap_or(0);
        Ok(seq)
    }
}

// ---------------------------------------------------------------------------
// MemoryChangeStore
// ---------------------------------------------------------------------------

/// Non-durable store kept in process memory. Same idempotent keying as redb.
#[derive(Debug, Default)]
pub struct MemoryChangeStore {
    records: Mutex<std::collections::BTreeMap<u64, StateChange>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeStore for MemoryChangeStore {
    fn append(&self, change: &StateChange) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(change.sequence, change.clone());
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<StateChange>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }
}
