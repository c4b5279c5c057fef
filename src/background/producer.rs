use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::{Job, JobId, QueueConfig};
use crate::store::{Store, StoreError, bounded};

/// Why a job could not be enqueued. Always returned to the caller; the
/// request handler decides whether to fail the request.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("job payload could not be serialized: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("job could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// Enqueues jobs onto one named queue. Cheap to clone into handlers.
#[derive(Clone)]
pub struct Producer {
    store: Arc<dyn Store>,
    queue: Arc<str>,
    store_timeout: Duration,
}

impl Producer {
    pub fn new(store: Arc<dyn Store>, config: &QueueConfig) -> Self {
        Self {
            store,
            queue: Arc::from(config.name.as_str()),
            store_timeout: config.store_timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Durably appends `payload` as a fresh `Pending` job.
    ///
    /// Returns once the store acknowledges the append; the job has not run
    /// yet.
    pub async fn enqueue<T>(&self, payload: &T) -> Result<JobId, EnqueueError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(EnqueueError::Payload)?;
        let job = Job::new(payload);

        bounded(self.store_timeout, self.store.enqueue(&self.queue, &job)).await?;

        info!(queue = %self.queue, job_id = %job.id, "job enqueued");
        Ok(job.id)
    }
}
