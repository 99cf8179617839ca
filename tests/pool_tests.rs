//! Worker pool bounds and cancellation, driven through the run coordinator

mod common;

use common::{targets, Script};
use portsnap::probe::ProbeOptions;
use portsnap::storage::{MemorySnapshotStore, SnapshotWriter};
use portsnap::targets::StaticTargetSource;
use portsnap::RunCoordinator;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn coordinator(n: usize, script: &Arc<Script>) -> RunCoordinator {
    RunCoordinator::new(
        Arc::new(StaticTargetSource::new(targets(n))),
        SnapshotWriter::new(Arc::new(MemorySnapshotStore::new())),
        script.factory(),
        ProbeOptions::default(),
    )
}

#[tokio::test]
async fn never_more_than_concurrency_probes_in_flight() {
    let script = Arc::new(Script::new().with_delay(Duration::from_millis(20)));

    let summary = coordinator(10, &script).run(None, 3).await.unwrap();

    assert_eq!(summary.scanned, 10);
    let peak = script.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight probes was {}", peak);
    assert!(peak >= 2, "probes never overlapped");
}

#[tokio::test]
async fn one_prober_per_worker() {
    let script = Arc::new(Script::new().with_delay(Duration::from_millis(5)));

    coordinator(20, &script).run(None, 4).await.unwrap();

    let built = script.handles_built.load(Ordering::SeqCst);
    assert!((1..=4).contains(&built), "built {} probers", built);
    assert_eq!(script.primary_calls.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn each_target_reported_exactly_once() {
    let script = Arc::new(Script::new().with_delay(Duration::from_millis(1)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let summary = coordinator(50, &script)
        .with_observer(Arc::new(move |_: usize, _: usize, outcome: &portsnap::ScanOutcome| {
            sink.lock().unwrap().push(outcome.target.identity.clone());
        }))
        .run(None, 7)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(summary.scanned, 50);
    assert_eq!(seen.len(), 50);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 50);
}

#[tokio::test]
async fn cancellation_keeps_finished_work_and_counts_the_rest() {
    let script = Arc::new(Script::new().with_delay(Duration::from_millis(100)));
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let summary = coordinator(10, &script)
        .with_cancellation(token)
        .run(None, 1)
        .await
        .unwrap();

    assert!(summary.scanned >= 1);
    assert!(summary.scanned < 10);
    assert!(summary.abandoned > 0);
    assert_eq!(summary.scanned + summary.abandoned, 10);
}
