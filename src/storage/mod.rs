//! Snapshot persistence
//!
//! [`SnapshotStore`] is the seam between the engine and the time-series table.
//! A host's snapshot is written through one [`SnapshotTransaction`]: the
//! same-day delete and the batch insert either both commit or neither does.
//! Dropping a transaction without calling `commit` rolls it back.

pub mod memory;
pub mod postgres;
pub mod writer;

use crate::error::{PersistenceError, SetupError};
use crate::model::{PortObservation, Protocol};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemorySnapshotStore;
pub use postgres::PgSnapshotStore;
pub use writer::{HostSnapshot, SnapshotWriter};

/// One persisted observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub address: String,
    pub identity: String,
    pub protocol: Protocol,
    pub port: u16,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn from_observation(
        address: &str,
        identity: &str,
        observation: &PortObservation,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            address: address.to_string(),
            identity: identity.to_string(),
            protocol: observation.protocol,
            port: observation.port,
            service: observation.service.clone(),
            timestamp,
        }
    }

    /// Columns of the table's uniqueness constraint
    pub fn conflict_key(&self) -> (&str, u16, Protocol, DateTime<Utc>) {
        (&self.address, self.port, self.protocol, self.timestamp)
    }
}

/// Half-open UTC range `[start, end)` covering `day`
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default());
    (start, start + Duration::days(1))
}

/// Time-series store for port snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Create table, constraint, hypertable and index if absent
    async fn ensure_schema(&self) -> Result<(), SetupError>;

    /// Open a write transaction
    async fn begin(&self) -> Result<Box<dyn SnapshotTransaction>, PersistenceError>;

    /// Rows stored for `(address, identity)` on `day`, ordered by port
    async fn rows_for(
        &self,
        address: &str,
        identity: &str,
        day: NaiveDate,
    ) -> Result<Vec<SnapshotRow>, PersistenceError>;

    /// Release connections
    async fn close(&self) {}
}

/// Atomic unit of work for one host's snapshot
#[async_trait]
pub trait SnapshotTransaction: Send {
    /// Delete rows for `(address, identity)` stamped on `day`; returns rows removed
    async fn delete_same_day(
        &mut self,
        address: &str,
        identity: &str,
        day: NaiveDate,
    ) -> Result<u64, PersistenceError>;

    /// Insert rows, updating service and identity on key conflicts; returns rows affected
    async fn insert_batch(&mut self, rows: &[SnapshotRow]) -> Result<u64, PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn day_bounds_span_one_utc_day() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        let (start, end) = day_bounds(day);
        assert_eq!(start.date_naive(), day);
        assert_eq!(start.hour(), 0);
        assert_eq!(end - start, Duration::days(1));
        assert_eq!(end.date_naive(), day.succ_opt().unwrap());
    }
}
