//! Snapshot writer semantics against the in-memory store

use chrono::{Duration, TimeZone, Utc};
use portsnap::storage::{MemorySnapshotStore, SnapshotRow, SnapshotStore, SnapshotWriter};
use portsnap::{PersistenceError, PortObservation, Protocol};
use std::sync::Arc;

fn obs(port: u16, service: &str) -> PortObservation {
    PortObservation::new(Protocol::Tcp, port, service)
}

fn writer(store: &MemorySnapshotStore) -> SnapshotWriter {
    SnapshotWriter::new(Arc::new(store.clone()))
}

#[tokio::test]
async fn rewriting_the_same_snapshot_is_idempotent() {
    let store = MemorySnapshotStore::new();
    let ts = Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap();
    let ports = vec![obs(22, "ssh"), obs(8899, "unknown")];

    let first = writer(&store).write_snapshot("10.0.0.1", "A", &ports, ts).await.unwrap();
    let after_first = store.rows().await;
    let second = writer(&store).write_snapshot("10.0.0.1", "A", &ports, ts).await.unwrap();
    let after_second = store.rows().await;

    assert_eq!(first, 2);
    assert_eq!(second, 2);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn later_scan_same_day_supersedes_earlier() {
    let store = MemorySnapshotStore::new();
    let morning = Utc.with_ymd_and_hms(2026, 10, 16, 6, 0, 0).unwrap();
    let evening = morning + Duration::hours(12);

    writer(&store)
        .write_snapshot("10.0.0.1", "A", &[obs(22, "ssh"), obs(80, "http")], morning)
        .await
        .unwrap();
    writer(&store)
        .write_snapshot("10.0.0.1", "A", &[obs(443, "https")], evening)
        .await
        .unwrap();

    let rows = store.rows_for("10.0.0.1", "A", morning.date_naive()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].port, 443);
    assert_eq!(rows[0].timestamp, evening);
}

#[tokio::test]
async fn earlier_days_are_kept() {
    let store = MemorySnapshotStore::new();
    let yesterday = Utc.with_ymd_and_hms(2026, 10, 15, 23, 59, 0).unwrap();
    let today = Utc.with_ymd_and_hms(2026, 10, 16, 0, 1, 0).unwrap();

    writer(&store).write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], yesterday).await.unwrap();
    writer(&store).write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], today).await.unwrap();

    assert_eq!(store.rows().await.len(), 2);
    assert_eq!(store.rows_for("10.0.0.1", "A", yesterday.date_naive()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn other_identities_on_the_same_address_are_untouched() {
    let store = MemorySnapshotStore::new();
    let ts = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();

    writer(&store).write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], ts).await.unwrap();
    writer(&store)
        .write_snapshot("10.0.0.1", "B", &[obs(8001, "unknown")], ts + Duration::minutes(5))
        .await
        .unwrap();

    assert_eq!(store.rows_for("10.0.0.1", "A", ts.date_naive()).await.unwrap().len(), 1);
    assert_eq!(store.rows_for("10.0.0.1", "B", ts.date_naive()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn empty_observations_write_nothing() {
    let store = MemorySnapshotStore::new();
    let ts = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
    writer(&store).write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], ts).await.unwrap();

    let saved = writer(&store)
        .write_snapshot("10.0.0.1", "A", &[], ts + Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(saved, 0);
    assert_eq!(store.delete_calls().await, 1);
    assert_eq!(store.rows().await.len(), 1);
}

#[tokio::test]
async fn failed_insert_rolls_back_the_delete() {
    let store = MemorySnapshotStore::new();
    let ts = Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap();
    writer(&store).write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], ts).await.unwrap();
    store.fail_inserts_for("10.0.0.1").await;

    let err = writer(&store)
        .write_snapshot("10.0.0.1", "A", &[obs(443, "https")], ts + Duration::hours(2))
        .await
        .unwrap_err();

    assert!(matches!(err, PersistenceError::Insert { .. }));
    let rows = store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].port, 22);
}

#[tokio::test]
async fn schema_is_ensured_before_each_write() {
    let store = MemorySnapshotStore::new();
    let ts = Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap();

    writer(&store).write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], ts).await.unwrap();
    writer(&store).write_snapshot("10.0.0.2", "B", &[obs(22, "ssh")], ts).await.unwrap();

    assert_eq!(store.schema_calls().await, 2);
}

#[tokio::test]
async fn duplicate_ports_in_one_batch_keep_the_last() {
    let store = MemorySnapshotStore::new();
    let ts = Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap();

    writer(&store)
        .write_snapshot("10.0.0.1", "A", &[obs(22, "ssh"), obs(22, "openssh")], ts)
        .await
        .unwrap();

    let rows = store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service, "openssh");
}

#[tokio::test]
async fn seeded_rows_from_another_day_survive() {
    let store = MemorySnapshotStore::new();
    let old = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap();
    store
        .insert_raw(SnapshotRow {
            address: "10.0.0.1".into(),
            identity: "A".into(),
            protocol: Protocol::Udp,
            port: 53,
            service: "domain".into(),
            timestamp: old,
        })
        .await;

    writer(&store)
        .write_snapshot("10.0.0.1", "A", &[obs(22, "ssh")], old + Duration::days(15))
        .await
        .unwrap();

    assert_eq!(store.rows().await.len(), 2);
}
