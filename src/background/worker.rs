use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{
    JobError, JobId, JobStatus, QueueConfig, STATUS_RETRY_DELAY, STATUS_WRITE_TRIES, TaskHandler,
};
use crate::store::{Store, StoreError, bounded};

/// Creates a shutdown channel for [`Worker::run`] and [`Worker::spawn`].
///
/// Sending `true` asks every consumer holding a receiver to stop after its
/// current job. Dropping the sender has the same effect.
///
/// ```rust
/// use readthru::background::shutdown_signal;
///
/// let (tx, rx) = shutdown_signal();
/// assert!(!*rx.borrow());
/// tx.send(true).ok();
/// assert!(*rx.borrow());
/// ```
pub fn shutdown_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Result of processing one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOutcome {
    pub id: JobId,
    /// Attempts made so far, including this one.
    pub attempts: u32,
    /// `Done`, `Pending` (requeued for retry) or `Failed` (dead-lettered).
    pub status: JobStatus,
}

/// Consumer of one queue.
///
/// Each attempt increments the job's `attempts`, whatever its outcome, so a
/// job that fails twice and then succeeds finishes `Done` with three
/// attempts. A failed attempt requeues the job until `max_attempts` is
/// reached; a [`JobError::Fatal`] dead-letters it at once.
///
/// Recording an outcome is retried a few times on store errors. If every try fails the job stays `Processing` until a later poll
/// finds its claim older than [`QueueConfig::visibility_timeout`] and
/// returns it to the queue.
#[derive(Clone)]
pub struct Worker {
    store: Arc<dyn Store>,
    handler: Arc<dyn TaskHandler>,
    config: Arc<QueueConfig>,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, handler: impl TaskHandler, config: QueueConfig) -> Self {
        Self {
            store,
            handler: Arc::new(handler),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claims and runs at most one job.
    ///
    /// Returns `Ok(None)` when nothing is pending. Handler failures are not
    /// errors here; they are reported through [`JobOutcome::status`].
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, StoreError> {
        let queue = self.config.name.as_str();
        let limit = self.config.store_timeout;

        let mut claimed = bounded(limit, self.store.claim_next(queue)).await?;
        if claimed.is_none() && self.reclaim_stale().await? > 0 {
            claimed = bounded(limit, self.store.claim_next(queue)).await?;
        }
        let Some(job) = claimed else {
            return Ok(None);
        };
        let attempts = job.attempts + 1;
        debug!(queue, job_id = %job.id, attempt = attempts, "job claimed");

        let result = match tokio::time::timeout(
            self.config.handler_timeout,
            self.handler.handle(&job.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(JobError::retryable(format!(
                "handler timed out after {:?}",
                self.config.handler_timeout
            ))),
        };

        let status = match &result {
            Ok(()) => JobStatus::Done,
            Err(e) if e.is_fatal() => JobStatus::Failed,
            Err(_) if attempts >= self.config.max_attempts => JobStatus::Failed,
            Err(_) => JobStatus::Pending,
        };

        self.record(job.id, status, attempts).await?;

        match (&result, status) {
            (Ok(()), _) => info!(queue, job_id = %job.id, attempts, "job done"),
            (Err(e), JobStatus::Pending) => warn!(
                queue,
                job_id = %job.id,
                attempts,
                max_attempts = self.config.max_attempts,
                error = %e,
                "job failed, requeued"
            ),
            (Err(e), _) => error!(
                queue,
                job_id = %job.id,
                attempts,
                payload = %job.payload,
                error = %e,
                "job dead-lettered"
            ),
        }

        Ok(Some(JobOutcome {
            id: job.id,
            attempts,
            status,
        }))
    }

    /// Returns claims older than the visibility timeout to the queue.
    ///
    /// [`Worker::process_next`] runs this whenever it finds nothing
    /// pending. Returns how many jobs were moved.
    pub async fn reclaim_stale(&self) -> Result<usize, StoreError> {
        let queue = self.config.name.as_str();
        let visibility = self.config.visibility_timeout();
        let moved = bounded(
            self.config.store_timeout,
            self.store
                .reclaim_stale(queue, visibility, self.config.max_attempts),
        )
        .await?;

        for job in &moved {
            if job.status == JobStatus::Failed {
                error!(
                    queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    payload = %job.payload,
                    "abandoned job dead-lettered"
                );
            } else {
                warn!(queue, job_id = %job.id, attempts = job.attempts, ?visibility, "abandoned job requeued");
            }
        }
        Ok(moved.len())
    }

    /// Writes an attempt's outcome, retrying store errors a few times.
    ///
    /// A retry that finds the job already in the requested state means an
    /// earlier try landed after its timeout, which counts as success.
    async fn record(&self, id: JobId, status: JobStatus, attempts: u32) -> Result<(), StoreError> {
        let queue = self.config.name.as_str();
        let limit = self.config.store_timeout;

        let mut tries = 0;
        loop {
            tries += 1;
            match bounded(limit, self.store.update_status(queue, id, status, attempts)).await {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::InvalidTransition { .. }) if tries > 1 => {
                    if let Ok(Some(job)) = bounded(limit, self.store.job(queue, id)).await {
                        if job.status == status && job.attempts == attempts {
                            return Ok(());
                        }
                    }
                    return Err(e);
                }
                Err(e @ (StoreError::Unavailable(_) | StoreError::Timeout(_)))
                    if tries < STATUS_WRITE_TRIES =>
                {
                    warn!(queue, job_id = %id, %status, tries, error = %e, "status write failed, retrying");
                    tokio::time::sleep(STATUS_RETRY_DELAY * tries).await;
                }
                Err(e) => {
                    error!(
                        queue,
                        job_id = %id,
                        %status,
                        attempts,
                        error = %e,
                        "status write failed, job left to the stale-claim sweep"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Sleeps `poll_interval` whenever the queue is empty or the store
    /// fails; otherwise claims the next job immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.name.as_str();
        info!(queue, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(queue, error = %e, "queue poll failed");
                    true
                }
            };
            if !idle {
                continue;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(queue, "worker stopped");
    }

    /// Starts `concurrency` consumers sharing this worker's store and
    /// handler. Claims are exclusive, so no job runs on two consumers at
    /// once.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> WorkerPool {
        let mut tasks = JoinSet::new();
        for consumer in 0..self.config.concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            let span = info_span!("consumer", queue = %self.config.name, consumer);
            tasks.spawn(async move { worker.run(shutdown).await }.instrument(span));
        }
        WorkerPool { tasks }
    }
}

/// Consumers started by [`Worker::spawn`].
pub struct WorkerPool {
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every consumer to stop.
    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker consumer panicked");
            }
        }
    }
}
