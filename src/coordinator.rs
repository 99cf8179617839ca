//! Run coordination
//!
//! A [`RunCoordinator`] executes exactly one run: fetch targets, fan them out
//! over the worker pool, and fold the outcomes into a [`RunSummary`]. Each
//! worker probes its target and writes the snapshot straight away, so a crash
//! mid-run keeps everything saved so far. The counters are only touched here,
//! while draining the outcome channel.

use crate::error::{EngineError, EngineResult};
use crate::model::{ProbeStrategy, ScanOutcome, ScanTarget};
use crate::pool::{TargetJob, WorkerPool};
use crate::probe::{ProbeAdapter, ProbeOptions, ProberFactory, StrategyOutcome};
use crate::storage::SnapshotWriter;
use crate::targets::TargetSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default number of failing hosts listed in a summary
pub const DEFAULT_FAILURE_PREVIEW: usize = 10;

/// Progress callback: `(completed, total, outcome)`
pub type RunObserver = Arc<dyn Fn(usize, usize, &ScanOutcome) + Send + Sync>;

/// Called on every phase transition
pub type PhaseObserver = Arc<dyn Fn(RunPhase) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    FetchingTargets,
    Scanning,
    Summarizing,
    Done,
}

/// A host that failed, for the summary preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub identity: String,
    pub address: String,
    pub error: String,
}

/// Totals for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub scanned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub saved: usize,
    /// Targets never started because the run was cancelled
    pub abandoned: usize,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// First failures, capped; `failed` is always the exact count
    pub failures: Vec<FailedTarget>,
}

impl RunSummary {
    fn empty(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            scanned: 0,
            succeeded: 0,
            failed: 0,
            saved: 0,
            abandoned: 0,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    /// Fold one outcome into the totals
    pub fn record(&mut self, outcome: &ScanOutcome, preview_cap: usize) {
        self.scanned += 1;
        if outcome.succeeded {
            self.succeeded += 1;
            self.saved += outcome.saved;
        } else {
            self.failed += 1;
            if self.failures.len() < preview_cap {
                self.failures.push(FailedTarget {
                    identity: outcome.target.identity.clone(),
                    address: outcome.target.address.clone(),
                    error: outcome.error.clone().unwrap_or_default(),
                });
            }
        }
    }

    /// Failures beyond the preview
    pub fn hidden_failures(&self) -> usize {
        self.failed.saturating_sub(self.failures.len())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Probe one target, then persist what was found
struct ScanAndSave {
    writer: SnapshotWriter,
    scan_timestamp: DateTime<Utc>,
}

#[async_trait]
impl TargetJob<ProbeAdapter> for ScanAndSave {
    async fn run(&self, adapter: &mut ProbeAdapter, target: &ScanTarget) -> ScanOutcome {
        let started = Instant::now();
        debug!("Scanning {}", target);

        let (ports, tier) = match adapter.run_strategy(&target.address).await {
            StrategyOutcome::PrimaryOk(ports) => (ports, ProbeStrategy::Primary),
            StrategyOutcome::FallbackOk { ports, .. } => (ports, ProbeStrategy::Fallback),
            StrategyOutcome::BothFailed(err) => {
                warn!("Failed to scan {}: {}", target, err);
                return ScanOutcome::failure(target.clone(), err.to_string(), started.elapsed());
            }
        };

        let saved = self
            .writer
            .write_snapshot(&target.address, &target.identity, &ports, self.scan_timestamp)
            .await;
        let outcome = ScanOutcome::success(target.clone(), ports, tier, started.elapsed());

        match saved {
            Ok(n) => {
                if n > 0 {
                    info!("Saved {} open ports for {}", n, target);
                }
                outcome.with_saved(n)
            }
            Err(e) => {
                warn!("Failed to save snapshot for {}: {}", target, e);
                outcome.mark_failed(e.to_string())
            }
        }
    }
}

/// Drives one scan-and-snapshot run
pub struct RunCoordinator {
    source: Arc<dyn TargetSource>,
    writer: SnapshotWriter,
    factory: ProberFactory,
    options: ProbeOptions,
    cancel: CancellationToken,
    failure_preview: usize,
    observer: Option<RunObserver>,
    phase_observer: Option<PhaseObserver>,
    phase: RunPhase,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("options", &self.options)
            .field("failure_preview", &self.failure_preview)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl RunCoordinator {
    pub fn new(
        source: Arc<dyn TargetSource>,
        writer: SnapshotWriter,
        factory: ProberFactory,
        options: ProbeOptions,
    ) -> Self {
        Self {
            source,
            writer,
            factory,
            options,
            cancel: CancellationToken::new(),
            failure_preview: DEFAULT_FAILURE_PREVIEW,
            observer: None,
            phase_observer: None,
            phase: RunPhase::Idle,
        }
    }

    /// Token that stops dispatching new targets when cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_failure_preview(mut self, cap: usize) -> Self {
        self.failure_preview = cap;
        self
    }

    pub fn with_observer(mut self, observer: RunObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_phase_observer(mut self, observer: PhaseObserver) -> Self {
        self.phase_observer = Some(observer);
        self
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("Run phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        if let Some(observer) = &self.phase_observer {
            observer(phase);
        }
    }

    /// Execute the run. Only failing to obtain targets is an error; per-host
    /// failures are counted in the summary.
    pub async fn run(mut self, limit: Option<usize>, concurrency: usize) -> EngineResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mut summary = RunSummary::empty(run_id, Utc::now());
        info!("Starting run {}", run_id);

        self.enter(RunPhase::FetchingTargets);
        let mut targets = self.source.fetch_targets().await.map_err(EngineError::from)?;
        if let Some(n) = limit {
            targets.truncate(n);
        }
        info!("Run {}: {} targets to scan", run_id, targets.len());

        if !targets.is_empty() {
            self.enter(RunPhase::Scanning);
            let abandoned = self.scan(targets, concurrency, &mut summary).await;
            summary.abandoned = abandoned;
        }

        self.enter(RunPhase::Summarizing);
        summary.elapsed = started.elapsed();
        info!(
            "Run {} finished in {:.1}s: {} scanned, {} succeeded, {} failed, {} ports saved",
            run_id,
            summary.elapsed.as_secs_f64(),
            summary.scanned,
            summary.succeeded,
            summary.failed,
            summary.saved
        );

        self.enter(RunPhase::Done);
        Ok(summary)
    }

    async fn scan(&self, targets: Vec<ScanTarget>, concurrency: usize, summary: &mut RunSummary) -> usize {
        let total = targets.len();
        let pool = WorkerPool::new(concurrency).with_cancellation(self.cancel.clone());
        let job = Arc::new(ScanAndSave {
            writer: self.writer.clone(),
            scan_timestamp: SnapshotWriter::scan_timestamp(),
        });

        let factory = self.factory.clone();
        let options = self.options.clone();
        let mut handle = pool.spawn(targets, move || ProbeAdapter::new(factory(), options.clone()), job);

        let mut completed = 0;
        while let Some(outcome) = handle.next().await {
            completed += 1;
            summary.record(&outcome, self.failure_preview);
            if let Some(observer) = &self.observer {
                observer(completed, total, &outcome);
            }
        }

        handle.finish().await
    }
}
