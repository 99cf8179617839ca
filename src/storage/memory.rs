//! In-memory snapshot store
//!
//! Used for `--dry-run` and by tests. Transactions stage their work and apply
//! it under one lock on commit, so readers never see half a snapshot.

use super::{day_bounds, SnapshotRow, SnapshotStore, SnapshotTransaction};
use crate::error::{PersistenceError, SetupError};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    rows: Vec<SnapshotRow>,
    schema_calls: usize,
    delete_calls: usize,
    commits: usize,
    fail_inserts_for: HashSet<String>,
}

/// Shared, cloneable in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    state: Arc<Mutex<State>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row
    pub async fn rows(&self) -> Vec<SnapshotRow> {
        self.state.lock().await.rows.clone()
    }

    /// Seed a row directly, bypassing the writer
    pub async fn insert_raw(&self, row: SnapshotRow) {
        self.state.lock().await.rows.push(row);
    }

    /// Make inserts for `address` fail, to exercise rollback
    pub async fn fail_inserts_for(&self, address: &str) {
        self.state.lock().await.fail_inserts_for.insert(address.to_string());
    }

    pub async fn schema_calls(&self) -> usize {
        self.state.lock().await.schema_calls
    }

    pub async fn delete_calls(&self) -> usize {
        self.state.lock().await.delete_calls
    }

    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn ensure_schema(&self) -> Result<(), SetupError> {
        self.state.lock().await.schema_calls += 1;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn SnapshotTransaction>, PersistenceError> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
        }))
    }

    async fn rows_for(
        &self,
        address: &str,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Vec<SnapshotRow>, PersistenceError> {
        let (start, end) = day_bounds(day);
        let state = self.state.lock().await;
        let mut rows: Vec<SnapshotRow> = state
            .rows
            .iter()
            .filter(|r| {
                r.address == address && r.identity == identity && r.timestamp >= start && r.timestamp < end
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.port, r.protocol));
        Ok(rows)
    }
}

#[derive(Debug)]
enum Staged {
    Delete {
        address: String,
        identity: String,
        day: NaiveDate,
    },
    Insert(Vec<SnapshotRow>),
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    staged: Vec<Staged>,
}

fn matches_day(row: &SnapshotRow, address: &str, identity: &str, day: NaiveDate) -> bool {
    let (start, end) = day_bounds(day);
    row.address == address && row.identity == identity && row.timestamp >= start && row.timestamp < end
}

#[async_trait]
impl SnapshotTransaction for MemoryTransaction {
    async fn delete_same_day(
        &mut self,
        address: &str,
        identity: &str,
        day: NaiveDate,
    ) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        state.delete_calls += 1;
        let count = state
            .rows
            .iter()
            .filter(|r| matches_day(r, address, identity, day))
            .count();
        self.staged.push(Staged::Delete {
            address: address.to_string(),
            identity: identity.to_string(),
            day,
        });
        Ok(count as u64)
    }

    async fn insert_batch(&mut self, rows: &[SnapshotRow]) -> Result<u64, PersistenceError> {
        let state = self.state.lock().await;
        if let Some(row) = rows.iter().find(|r| state.fail_inserts_for.contains(&r.address)) {
            return Err(PersistenceError::Insert {
                address: row.address.clone(),
                cause: "injected insert failure".to_string(),
            });
        }
        self.staged.push(Staged::Insert(rows.to_vec()));
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let MemoryTransaction { state, staged } = *self;
        let mut state = state.lock().await;
        for op in staged {
            match op {
                Staged::Delete { address, identity, day } => {
                    state.rows.retain(|r| !matches_day(r, &address, &identity, day));
                }
                Staged::Insert(rows) => {
                    for row in rows {
                        match state.rows.iter_mut().find(|r| r.conflict_key() == row.conflict_key()) {
                            Some(existing) => {
                                existing.service = row.service;
                                existing.identity = row.identity;
                            }
                            None => state.rows.push(row),
                        }
                    }
                }
            }
        }
        state.commits += 1;
        Ok(())
    }
}
