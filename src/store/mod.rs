//! Shared key-value store interface.
//!
//! The response cache and the task queue both live in one external store,
//! under disjoint namespaces (`cache:*` and `queue:*`). Every component
//! receives an `Arc<dyn Store>` at construction, so production wiring uses
//! a networked backend and tests substitute [`MemoryStore`].
//!
//! The store is the only shared mutable resource. Conflicting writes to the
//! same key or job are serialized by the backend; no application-level
//! locking is layered on top.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::background::{Job, JobId, JobStatus};

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors surfaced by a [`Store`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to encode or decode stored value: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("job {id} not found in queue {queue}")]
    JobNotFound { queue: String, id: JobId },

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id} attempts cannot go from {current} down to {requested}")]
    AttemptsDecreased {
        id: JobId,
        current: u32,
        requested: u32,
    },

    #[error("stored record for job {id} is corrupt: {reason}")]
    CorruptRecord { id: JobId, reason: String },
}

/// The narrow interface both the cache and the queue consume.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a live (non-expired) value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Writes `value` under `key`, expiring it lazily after `ttl`.
    /// Overwrites any existing value.
    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Durably appends `job` to `queue`.
    async fn enqueue(&self, queue: &str, job: &Job) -> Result<(), StoreError>;

    /// Claims the oldest pending job, moving it to `Processing`.
    ///
    /// A claimed job is invisible to other claimers until it returns to
    /// `Pending`.
    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, StoreError>;

    /// Records a status transition and the attempt count.
    ///
    /// Rejects transitions [`JobStatus::can_transition_to`] forbids and any
    /// decrease in attempts. A job moved back to `Pending` becomes claimable
    /// again; a job moved to `Failed` is added to the dead-letter list.
    async fn update_status(
        &self,
        queue: &str,
        id: JobId,
        status: JobStatus,
        attempts: u32,
    ) -> Result<(), StoreError>;

    /// Returns claims older than `visibility` to the queue.
    ///
    /// Each stale `Processing` job is resolved as [`Job::abandoned`] says:
    /// back to `Pending` (claimable again) or, once it has used
    /// `max_attempts`, to `Failed`. Returns the moved jobs in their new
    /// state, oldest claim first.
    async fn reclaim_stale(
        &self,
        queue: &str,
        visibility: Duration,
        max_attempts: u32,
    ) -> Result<Vec<Job>, StoreError>;

    /// Looks up a job regardless of its status.
    async fn job(&self, queue: &str, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs that exhausted their attempts, oldest failure first.
    async fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError>;
}

/// Bounds a store operation by `limit`, mapping expiry to
/// [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Validates a requested transition against the job's current state.
pub(crate) fn check_transition(
    job: &Job,
    status: JobStatus,
    attempts: u32,
) -> Result<(), StoreError> {
    if !job.status.can_transition_to(status) {
        return Err(StoreError::InvalidTransition {
            id: job.id,
            from: job.status,
            to: status,
        });
    }
    if attempts < job.attempts {
        return Err(StoreError::AttemptsDecreased {
            id: job.id,
            current: job.attempts,
            requested: attempts,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out_slow_operations() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(())
        };
        let err = bounded(Duration::from_secs(1), slow).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(d) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let value = bounded(Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn check_transition_rejects_regressions() {
        let mut job = Job::new(json!({}));
        job.status = JobStatus::Failed;
        job.attempts = 3;
        assert!(matches!(
            check_transition(&job, JobStatus::Pending, 3),
            Err(StoreError::InvalidTransition { .. })
        ));

        job.status = JobStatus::Processing;
        assert!(matches!(
            check_transition(&job, JobStatus::Pending, 2),
            Err(StoreError::AttemptsDecreased { current: 3, requested: 2, .. })
        ));
        assert!(check_transition(&job, JobStatus::Pending, 4).is_ok());
    }
}
