//! Process-local [`Store`] used in tests and single-node setups.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Store, StoreError, check_transition};
use crate::background::{Job, JobId, JobStatus};

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    pending: VecDeque<JobId>,
    failed: Vec<JobId>,
    /// Live claims, timed on the Tokio clock.
    claimed: HashMap<JobId, Instant>,
}

impl QueueState {
    fn settle(&mut self, id: JobId, status: JobStatus) {
        self.claimed.remove(&id);
        match status {
            JobStatus::Pending => self.pending.push_back(id),
            JobStatus::Failed => self.failed.push(id),
            JobStatus::Processing | JobStatus::Done => {}
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    queues: HashMap<String, QueueState>,
}

/// An in-memory store with lazy TTL expiry and exclusive job claims.
///
/// Expiry and claim age are measured on the Tokio clock, so tests can
/// pause and advance time. Entries are only dropped when a read finds them expired; there is
/// no background eviction.
///
/// [`MemoryStore::set_offline`] makes every operation fail with
/// [`StoreError::Unavailable`], for exercising degraded paths.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use bytes::Bytes;
/// use readthru::store::{MemoryStore, Store};
///
/// # async fn demo() -> Result<(), readthru::store::StoreError> {
/// let store = MemoryStore::new();
/// store.set_with_ttl("cache:GET:/", Bytes::from_static(b"hi"), Duration::from_secs(5)).await?;
/// assert_eq!(store.get("cache:GET:/").await?, Some(Bytes::from_static(b"hi")));
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable backend.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".to_owned()))
        } else {
            Ok(())
        }
    }

    /// Number of jobs waiting to be claimed in `queue`.
    pub fn pending_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.pending.len())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => return Ok(None),
            Some(entry) if Instant::now() < entry.expires_at => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
        };
        if expired {
            inner.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_online()?;
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().entries.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        let state = inner.queues.entry(queue.to_owned()).or_default();
        if job.status == JobStatus::Pending {
            state.pending.push_back(job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        while let Some(id) = state.pending.pop_front() {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Pending {
                    job.status = JobStatus::Processing;
                    job.claimed_at = Some(Utc::now());
                    state.claimed.insert(id, Instant::now());
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn update_status(
        &self,
        queue: &str,
        id: JobId,
        status: JobStatus,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        let not_found = || StoreError::JobNotFound {
            queue: queue.to_owned(),
            id,
        };
        let state = inner.queues.get_mut(queue).ok_or_else(not_found)?;
        let job = state.jobs.get_mut(&id).ok_or_else(not_found)?;

        check_transition(job, status, attempts)?;
        job.status = status;
        job.attempts = attempts;
        if status == JobStatus::Processing {
            job.claimed_at = Some(Utc::now());
            state.pending.retain(|pending| *pending != id);
            state.claimed.insert(id, Instant::now());
        } else {
            job.claimed_at = None;
            state.settle(id, status);
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        visibility: Duration,
        max_attempts: u32,
    ) -> Result<Vec<Job>, StoreError> {
        self.ensure_online()?;
        let mut inner = self.inner.lock();
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut stale: Vec<(Instant, JobId)> = state
            .claimed
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= visibility)
            .map(|(id, at)| (*at, *id))
            .collect();
        stale.sort_unstable();

        let mut moved = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            let Some(job) = state.jobs.get_mut(&id) else {
                state.claimed.remove(&id);
                continue;
            };
            let (status, attempts) = job.abandoned(max_attempts);
            job.status = status;
            job.attempts = attempts;
            job.claimed_at = None;
            moved.push(job.clone());
            state.settle(id, status);
        }
        Ok(moved)
    }

    async fn job(&self, queue: &str, id: JobId) -> Result<Option<Job>, StoreError> {
        self.ensure_online()?;
        let inner = self.inner.lock();
        Ok(inner
            .queues
            .get(queue)
            .and_then(|state| state.jobs.get(&id))
            .cloned())
    }

    async fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        self.ensure_online()?;
        let inner = self.inner.lock();
        let Some(state) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(state
            .failed
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const QUEUE: &str = "mail";

    #[tokio::test(start_paused = true)]
    async fn entries_expire_lazily_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.inner.lock().entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_overwrites_value_and_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", Bytes::from_static(b"old"), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        store
            .set_with_ttl("k", Bytes::from_static(b"new"), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn claims_are_fifo_and_exclusive() {
        let store = MemoryStore::new();
        let first = Job::new(json!(1));
        let second = Job::new(json!(2));
        store.enqueue(QUEUE, &first).await.unwrap();
        store.enqueue(QUEUE, &second).await.unwrap();

        let claimed = store.claim_next(QUEUE).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Processing);

        let claimed = store.claim_next(QUEUE).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(store.claim_next(QUEUE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retried_job_goes_behind_newer_arrivals() {
        let store = MemoryStore::new();
        let first = Job::new(json!("first"));
        store.enqueue(QUEUE, &first).await.unwrap();
        store.claim_next(QUEUE).await.unwrap();

        let newer = Job::new(json!("newer"));
        store.enqueue(QUEUE, &newer).await.unwrap();
        store
            .update_status(QUEUE, first.id, JobStatus::Pending, 1)
            .await
            .unwrap();

        assert_eq!(store.claim_next(QUEUE).await.unwrap().unwrap().id, newer.id);
        let retried = store.claim_next(QUEUE).await.unwrap().unwrap();
        assert_eq!(retried.id, first.id);
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn failed_jobs_are_dead_lettered_and_never_reclaimed() {
        let store = MemoryStore::new();
        let job = Job::new(json!({}));
        store.enqueue(QUEUE, &job).await.unwrap();
        store.claim_next(QUEUE).await.unwrap();
        store
            .update_status(QUEUE, job.id, JobStatus::Failed, 1)
            .await
            .unwrap();

        assert!(store.claim_next(QUEUE).await.unwrap().is_none());
        let failed = store.failed_jobs(QUEUE).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, JobStatus::Failed);

        let err = store
            .update_status(QUEUE, job.id, JobStatus::Pending, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_claims_return_to_the_queue_counting_an_attempt() {
        let store = MemoryStore::new();
        let job = Job::new(json!({}));
        store.enqueue(QUEUE, &job).await.unwrap();
        let claimed = store.claim_next(QUEUE).await.unwrap().unwrap();
        assert!(claimed.claimed_at.is_some());

        let visibility = Duration::from_secs(30);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(store.reclaim_stale(QUEUE, visibility, 3).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let moved = store.reclaim_stale(QUEUE, visibility, 3).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].status, JobStatus::Pending);
        assert_eq!(moved[0].attempts, 1);
        assert_eq!(moved[0].claimed_at, None);

        let again = store.claim_next(QUEUE).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_claim_on_its_last_attempt_is_dead_lettered() {
        let store = MemoryStore::new();
        let job = Job::new(json!({}));
        store.enqueue(QUEUE, &job).await.unwrap();
        store.claim_next(QUEUE).await.unwrap();
        store.update_status(QUEUE, job.id, JobStatus::Pending, 1).await.unwrap();
        store.claim_next(QUEUE).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let moved = store.reclaim_stale(QUEUE, Duration::from_secs(5), 2).await.unwrap();
        assert_eq!(moved[0].status, JobStatus::Failed);
        assert_eq!(moved[0].attempts, 2);
        assert!(store.claim_next(QUEUE).await.unwrap().is_none());
        assert_eq!(store.failed_jobs(QUEUE).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_jobs_are_not_reclaimed() {
        let store = MemoryStore::new();
        let job = Job::new(json!({}));
        store.enqueue(QUEUE, &job).await.unwrap();
        store.claim_next(QUEUE).await.unwrap();
        store.update_status(QUEUE, job.id, JobStatus::Done, 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(store.reclaim_stale(QUEUE, Duration::ZERO, 3).await.unwrap().is_empty());
        let done = store.job(QUEUE, job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.claimed_at, None);
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let store = MemoryStore::new();
        let err = store
            .update_status(QUEUE, JobId::new(), JobStatus::Done, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn offline_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
        assert!(store.enqueue(QUEUE, &Job::new(json!({}))).await.is_err());

        store.set_offline(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
