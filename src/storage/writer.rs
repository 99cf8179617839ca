//! Per-host snapshot writes

use super::{SnapshotRow, SnapshotStore};
use crate::error::PersistenceError;
use crate::model::PortObservation;
use chrono::{DateTime, SubsecRound, Utc};
use log::{debug, error, warn};
use std::sync::Arc;

/// Observations for one host, awaiting a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub address: String,
    pub identity: String,
    pub ports: Vec<PortObservation>,
}

impl HostSnapshot {
    pub fn new(address: impl Into<String>, identity: impl Into<String>, ports: Vec<PortObservation>) -> Self {
        Self {
            address: address.into(),
            identity: identity.into(),
            ports,
        }
    }
}

/// Replaces a host's same-day snapshot with a fresh one, atomically
#[derive(Clone)]
pub struct SnapshotWriter {
    store: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for SnapshotWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotWriter").finish_non_exhaustive()
    }
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Timestamp for a new scan, at the precision the database stores
    pub fn scan_timestamp() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    /// Write `ports` for one host under `scan_timestamp`; returns rows written
    pub async fn write_snapshot(
        &self,
        address: &str,
        identity: &str,
        ports: &[PortObservation],
        scan_timestamp: DateTime<Utc>,
    ) -> Result<usize, PersistenceError> {
        if ports.is_empty() {
            debug!("No open ports for {}; nothing to save", address);
            return Ok(0);
        }

        if let Err(e) = self.store.ensure_schema().await {
            if !e.is_already_exists() {
                warn!("Schema provisioning failed, continuing with write: {}", e);
            }
        }

        let timestamp = scan_timestamp.trunc_subsecs(6);
        let day = timestamp.date_naive();
        let rows: Vec<SnapshotRow> = ports
            .iter()
            .map(|p| SnapshotRow::from_observation(address, identity, p, timestamp))
            .collect();

        // Dropping `tx` on any error below rolls the transaction back
        let mut tx = self.store.begin().await?;
        let removed = tx.delete_same_day(address, identity, day).await?;
        if removed > 0 {
            debug!("Superseded {} same-day rows for {}", removed, address);
        }
        tx.insert_batch(&rows).await?;
        tx.commit().await?;

        debug!("Saved {} ports for {}", ports.len(), address);
        Ok(ports.len())
    }

    /// Write several hosts under one shared timestamp, one transaction each.
    /// Failures are logged and skipped; returns the total rows written.
    pub async fn write_snapshots(&self, snapshots: &[HostSnapshot]) -> usize {
        let timestamp = Self::scan_timestamp();
        let mut total = 0;

        for snapshot in snapshots {
            match self
                .write_snapshot(&snapshot.address, &snapshot.identity, &snapshot.ports, timestamp)
                .await
            {
                Ok(n) => total += n,
                Err(e) => error!("Failed to save snapshot for {}: {}", snapshot.address, e),
            }
        }

        total
    }
}
