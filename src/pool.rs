//! Bounded worker pool
//!
//! `concurrency` tokio tasks pull targets from a bounded queue fed by a single
//! feeder task; the feeder blocks while every worker is busy. Each worker
//! lazily builds its own private state from the injected factory on its first
//! target and keeps it for its lifetime. Every dispatched target produces
//! exactly one [`ScanOutcome`] on the outcome channel, even when the job
//! panics.

use crate::model::{ScanOutcome, ScanTarget};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, warn};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Work done for one target by a worker holding state `W`
#[async_trait]
pub trait TargetJob<W: Send>: Send + Sync {
    async fn run(&self, worker: &mut W, target: &ScanTarget) -> ScanOutcome;
}

/// Fixed-size pool of parallel workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop dispatching new targets once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Start the pool; outcomes are read from the returned handle
    pub fn spawn<W, F, J>(&self, targets: Vec<ScanTarget>, factory: F, job: Arc<J>) -> PoolHandle
    where
        W: Send + 'static,
        F: Fn() -> W + Send + Sync + 'static,
        J: TargetJob<W> + 'static,
    {
        let submitted = targets.len();
        let worker_count = self.concurrency.min(submitted);
        let (work_tx, work_rx) = mpsc::channel::<ScanTarget>(self.concurrency);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let factory = Arc::new(factory);

        let feeder = tokio::spawn(feed(targets, work_tx, self.cancel.clone()));

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            workers.spawn(worker_loop(
                id,
                work_rx.clone(),
                outcome_tx.clone(),
                factory.clone(),
                job.clone(),
                self.cancel.clone(),
            ));
        }
        drop(outcome_tx);

        debug!("Worker pool started: {} workers for {} targets", worker_count, submitted);

        PoolHandle {
            outcomes: outcome_rx,
            feeder,
            workers,
            queue: work_rx,
            submitted,
        }
    }

    /// Run every target and collect the outcomes in completion order
    pub async fn run_all<W, F, J>(&self, targets: Vec<ScanTarget>, factory: F, job: Arc<J>) -> Vec<ScanOutcome>
    where
        W: Send + 'static,
        F: Fn() -> W + Send + Sync + 'static,
        J: TargetJob<W> + 'static,
    {
        let mut handle = self.spawn(targets, factory, job);
        let mut outcomes = Vec::with_capacity(handle.submitted());
        while let Some(outcome) = handle.next().await {
            outcomes.push(outcome);
        }
        handle.finish().await;
        outcomes
    }
}

/// A running pool
pub struct PoolHandle {
    outcomes: mpsc::UnboundedReceiver<ScanOutcome>,
    feeder: JoinHandle<usize>,
    workers: JoinSet<()>,
    queue: Arc<Mutex<mpsc::Receiver<ScanTarget>>>,
    submitted: usize,
}

impl PoolHandle {
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Next finished outcome; `None` once every worker has exited
    pub async fn next(&mut self) -> Option<ScanOutcome> {
        self.outcomes.recv().await
    }

    /// Wait for the pool to wind down and return how many targets were never started
    pub async fn finish(mut self) -> usize {
        let mut abandoned = match (&mut self.feeder).await {
            Ok(unsent) => unsent,
            Err(e) => {
                error!("Target feeder failed: {}", e);
                0
            }
        };

        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        // Queued but never picked up because the run was cancelled
        let mut queue = self.queue.lock().await;
        queue.close();
        while queue.try_recv().is_ok() {
            abandoned += 1;
        }

        if abandoned > 0 {
            warn!("{} targets abandoned before they were started", abandoned);
        }
        abandoned
    }
}

/// Push targets into the bounded queue; returns how many were never sent
async fn feed(targets: Vec<ScanTarget>, work_tx: mpsc::Sender<ScanTarget>, cancel: CancellationToken) -> usize {
    let mut pending = targets.into_iter();

    while let Some(target) = pending.next() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return 1 + pending.count();
            }
            sent = work_tx.send(target) => {
                if sent.is_err() {
                    // All workers are gone
                    return 1 + pending.count();
                }
            }
        }
    }

    0
}

async fn worker_loop<W, F, J>(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<ScanTarget>>>,
    outcomes: mpsc::UnboundedSender<ScanOutcome>,
    factory: Arc<F>,
    job: Arc<J>,
    cancel: CancellationToken,
) where
    W: Send + 'static,
    F: Fn() -> W + Send + Sync + 'static,
    J: TargetJob<W> + 'static,
{
    let mut state: Option<W> = None;

    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                target = queue.recv() => target,
            }
        };
        let Some(target) = next else { break };

        let started = Instant::now();
        let outcome = match run_one(&mut state, factory.as_ref(), job.as_ref(), &target).await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!("Worker {} panicked while handling {}: {}", id, target, panic);
                // The handle may be in an inconsistent state; rebuild it for the next target
                state = None;
                ScanOutcome::failure(target, format!("worker panicked: {}", panic), started.elapsed())
            }
        };

        if outcomes.send(outcome).is_err() {
            debug!("Worker {} stopping: outcome receiver dropped", id);
            break;
        }
    }

    debug!("Worker {} exiting", id);
}

async fn run_one<W, F, J>(state: &mut Option<W>, factory: &F, job: &J, target: &ScanTarget) -> Result<ScanOutcome, String>
where
    W: Send + 'static,
    F: Fn() -> W + Send + Sync + 'static,
    J: TargetJob<W> + 'static,
{
    if state.is_none() {
        let built = std::panic::catch_unwind(AssertUnwindSafe(factory)).map_err(panic_message)?;
        *state = Some(built);
    }
    let worker = match state.as_mut() {
        Some(worker) => worker,
        None => return Err("worker state missing".to_string()),
    };

    AssertUnwindSafe(job.run(worker, target))
        .catch_unwind()
        .await
        .map_err(panic_message)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
