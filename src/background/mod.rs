//! Durable background task queue.
//!
//! A [`Producer`] turns a serializable payload into a [`Job`] and appends it to
//! the shared [`Store`](crate::store::Store); it returns as soon as the store
//! acknowledges the append. A [`Worker`] runs independently of any request,
//! claims pending jobs one at a time and feeds their payloads to a single
//! registered [`TaskHandler`].
//!
//! ```text
//! handler ──enqueue──▶ Store ◀──claim / update_status── Worker ──▶ TaskHandler
//! ```
//!
//! Delivery is at least once: a failed attempt returns the job to `Pending`
//! until it has been attempted `max_attempts` times, then it is dead-lettered
//! as `Failed` and logged. Retries carry no backoff; a requeued job is
//! claimable on the next poll.
//!
//! A claim whose worker never records an outcome (it crashed, or the store
//! kept rejecting the status write) is returned to `Pending` once it is older
//! than [`QueueConfig::visibility_timeout`]. The lost claim counts as an
//! attempt, so a job that keeps getting stranded still ends up dead-lettered.

use std::time::Duration;

mod handler;
mod job;
mod producer;
mod worker;

pub use handler::{JobError, TaskHandler};
pub use job::{Job, JobId, JobStatus, UnknownStatus};
pub use producer::{EnqueueError, Producer};
pub use worker::{JobOutcome, Worker, WorkerPool, shutdown_signal};

/// Settings shared by the producer and the workers of one queue.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use readthru::background::QueueConfig;
///
/// let config = QueueConfig {
///     max_attempts: 5,
///     poll_interval: Duration::from_millis(200),
///     ..QueueConfig::new("mail")
/// };
/// assert_eq!(config.concurrency, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue name; jobs live under `queue:{name}:*` in the store.
    pub name: String,
    /// Total attempts a job gets before it is dead-lettered.
    pub max_attempts: u32,
    /// Sleep between polls while the queue is empty or the store is failing.
    pub poll_interval: Duration,
    /// Number of consumers [`Worker::spawn`] starts.
    pub concurrency: usize,
    /// An attempt running longer than this counts as a retryable failure.
    pub handler_timeout: Duration,
    /// Bound on each store call made by the producer or a worker.
    pub store_timeout: Duration,
}

/// Tries a worker makes at recording a job's outcome.
pub(crate) const STATUS_WRITE_TRIES: u32 = 3;
/// Pause before the n-th retry of a status write is `n` times this.
pub(crate) const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

impl QueueConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Age after which a `Processing` claim is considered abandoned.
    ///
    /// Covers the longest a live worker can hold a claim: the handler
    /// timeout plus the claim and every status write try, each bounded by
    /// `store_timeout`, plus the pauses between tries.
    ///
    /// ```
    /// use std::time::Duration;
    /// use readthru::background::QueueConfig;
    ///
    /// let config = QueueConfig::new("mail");
    /// assert!(config.visibility_timeout() > config.handler_timeout + config.store_timeout);
    /// ```
    pub fn visibility_timeout(&self) -> Duration {
        let pauses = STATUS_RETRY_DELAY * (STATUS_WRITE_TRIES * (STATUS_WRITE_TRIES - 1) / 2);
        self.handler_timeout + self.store_timeout * (STATUS_WRITE_TRIES + 1) + pauses
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            poll_interval: Duration::from_secs(1),
            concurrency: 1,
            handler_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("default")
    }
}
