//! Background deletion of speech artifacts.
//!
//! A single worker task owns every deletion once a [`CleanupJob`] has been
//! filed. Immediate jobs are executed as they arrive; delayed jobs sit in an
//! in-memory schedule that is swept on a fixed interval. Filing never blocks.
//! When the bounded job queue is saturated, delayed jobs go to the schedule
//! through an unbounded overflow channel and immediate jobs are deleted
//! inline. Once the worker is gone every job is deleted inline.

use crate::blob::{ArtifactRef, BlobStore};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A request to delete one artifact, now or not before a deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    pub artifact: ArtifactRef,
    pub not_before: Option<Instant>,
}

impl CleanupJob {
    pub fn immediate(artifact: ArtifactRef) -> Self {
        Self {
            artifact,
            not_before: None,
        }
    }

    pub fn delayed(artifact: ArtifactRef, delay: Duration) -> Self {
        Self {
            artifact,
            not_before: Some(Instant::now() + delay),
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.not_before.is_none()
    }
}

/// Cloneable producer side of the cleanup queue
#[derive(Clone, Debug)]
pub struct CleanupHandle {
    tx: mpsc::Sender<CleanupJob>,
    // delayed jobs that did not fit in `tx`
    overflow: Option<mpsc::UnboundedSender<CleanupJob>>,
    store: Arc<BlobStore>,
    scheduled: Arc<AtomicUsize>,
}

impl CleanupHandle {
    /// Wrap an existing job channel. The receiver may be a [`CleanupWorker`]
    /// or anything else that consumes jobs. Handles built this way have no
    /// overflow path: a job that does not fit is deleted inline.
    pub fn new(tx: mpsc::Sender<CleanupJob>, store: Arc<BlobStore>) -> Self {
        Self {
            tx,
            overflow: None,
            store,
            scheduled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn delete_now(&self, artifact: ArtifactRef) {
        self.file(CleanupJob::immediate(artifact));
    }

    pub fn delete_after(&self, artifact: ArtifactRef, delay: Duration) {
        self.file(CleanupJob::delayed(artifact, delay));
    }

    /// Hand a job to the worker without blocking
    pub fn file(&self, job: CleanupJob) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                let job = match (&self.overflow, job.is_immediate()) {
                    (Some(overflow), false) => match overflow.send(job) {
                        Ok(()) => {
                            debug!(target: "cleanup", "Cleanup queue full; delayed job sent to overflow");
                            return;
                        }
                        Err(mpsc::error::SendError(job)) => job,
                    },
                    _ => job,
                };
                warn!(target: "cleanup", artifact = %job.artifact, "Cleanup queue full; deleting inline");
                log_outcome(&job.artifact, self.store.delete_blocking(&job.artifact));
            }
            Err(TrySendError::Closed(job)) => {
                debug!(target: "cleanup", artifact = %job.artifact, "Cleanup worker stopped; deleting inline");
                log_outcome(&job.artifact, self.store.delete_blocking(&job.artifact));
            }
        }
    }

    /// Number of delayed deletions currently held by the worker
    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Relaxed)
    }
}

/// Consumer side: owns the delayed schedule
pub struct CleanupWorker {
    store: Arc<BlobStore>,
    schedule: HashMap<ArtifactRef, Instant>,
    gauge: Arc<AtomicUsize>,
}

impl CleanupWorker {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self {
            store,
            schedule: HashMap::new(),
            gauge: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the worker on the current runtime.
    ///
    /// Sending on (or dropping) the returned `oneshot::Sender` stops the
    /// worker after it drains queued jobs and deletes everything still
    /// scheduled. A zero `sweep_interval` is raised to a small minimum.
    pub fn spawn(
        store: Arc<BlobStore>,
        capacity: usize,
        sweep_interval: Duration,
    ) -> (CleanupHandle, oneshot::Sender<()>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (overflow_tx, overflow_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Self::new(Arc::clone(&store));
        let handle = CleanupHandle {
            tx,
            overflow: Some(overflow_tx),
            store,
            scheduled: Arc::clone(&worker.gauge),
        };
        let sweep_interval = sweep_interval.max(MIN_SWEEP_INTERVAL);
        let join = tokio::spawn(worker.run(rx, overflow_rx, shutdown_rx, sweep_interval));
        (handle, shutdown_tx, join)
    }

    /// Apply one job: delete now, or record it in the schedule. An
    /// immediate job supersedes any pending delayed one for the same
    /// artifact; duplicate delayed jobs keep the earliest deadline.
    pub async fn accept(&mut self, job: CleanupJob, now: Instant) {
        match job.not_before {
            Some(at) if at > now => {
                self.schedule
                    .entry(job.artifact)
                    .and_modify(|existing| *existing = (*existing).min(at))
                    .or_insert(at);
            }
            _ => {
                self.schedule.remove(&job.artifact);
                log_outcome(&job.artifact, self.store.delete(&job.artifact).await);
            }
        }
        self.publish_gauge();
    }

    /// Delete every scheduled artifact whose deadline has passed
    pub async fn sweep(&mut self, now: Instant) -> usize {
        let due: Vec<ArtifactRef> = self
            .schedule
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(artifact, _)| artifact.clone())
            .collect();
        for artifact in &due {
            self.schedule.remove(artifact);
            log_outcome(artifact, self.store.delete(artifact).await);
        }
        self.publish_gauge();
        due.len()
    }

    pub fn scheduled(&self) -> usize {
        self.schedule.len()
    }

    pub fn is_scheduled(&self, artifact: &ArtifactRef) -> bool {
        self.schedule.contains_key(artifact)
    }

    async fn flush(&mut self) {
        let pending: Vec<ArtifactRef> = self.schedule.drain().map(|(a, _)| a).collect();
        for artifact in &pending {
            log_outcome(artifact, self.store.delete(artifact).await);
        }
        self.publish_gauge();
    }

    fn publish_gauge(&self) {
        self.gauge.store(self.schedule.len(), Ordering::Relaxed);
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<CleanupJob>,
        mut overflow: mpsc::UnboundedReceiver<CleanupJob>,
        mut shutdown: oneshot::Receiver<()>,
        sweep_interval: Duration,
    ) {
        info!(target: "cleanup", interval_ms = sweep_interval.as_millis() as u64, "Cleanup worker started");
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_job = rx.recv() => match maybe_job {
                    Some(job) => self.accept(job, Instant::now()).await,
                    None => break,
                },
                Some(job) = overflow.recv() => self.accept(job, Instant::now()).await,
                _ = ticker.tick() => {
                    let swept = self.sweep(Instant::now()).await;
                    if swept > 0 {
                        debug!(target: "cleanup", swept, remaining = self.scheduled(), "Swept delayed artifacts");
                    }
                }
                _ = &mut shutdown => {
                    while let Ok(job) = rx.try_recv() {
                        self.accept(job, Instant::now()).await;
                    }
                    break;
                }
            }
        }

        while let Ok(job) = overflow.try_recv() {
            self.accept(job, Instant::now()).await;
        }
        let pending = self.scheduled();
        self.flush().await;
        info!(target: "cleanup", flushed = pending, "Cleanup worker stopped");
    }
}

/// Deletion failures are logged, never propagated
fn log_outcome(artifact: &ArtifactRef, outcome: Result<bool>) {
    match outcome {
        Ok(true) => debug!(target: "cleanup", artifact = %artifact, "Deleted artifact"),
        Ok(false) => debug!(target: "cleanup", artifact = %artifact, "Artifact already gone"),
        Err(e) => warn!(target: "cleanup", artifact = %artifact, error = %e, "Failed to delete artifact"),
    }
}
