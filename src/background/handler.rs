use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a [`TaskHandler`].
#[derive(Debug, Error)]
pub enum JobError {
    /// The attempt failed but may succeed later; the job is requeued while
    /// it has attempts left.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The job can never succeed; it is dead-lettered without further
    /// attempts.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(reason: impl ToString) -> Self {
        Self::Retryable(reason.to_string())
    }

    pub fn fatal(reason: impl ToString) -> Self {
        Self::Fatal(reason.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

// A payload that does not deserialize will not deserialize on retry either.
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("malformed payload: {err}"))
    }
}

/// The single function a [`Worker`](super::Worker) runs for every job.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = Result<(), JobError>>`,
/// so a closure is usually enough:
///
/// ```rust
/// use readthru::background::{JobError, TaskHandler};
/// use serde_json::Value;
///
/// fn assert_handler(_: impl TaskHandler) {}
///
/// assert_handler(|payload: Value| async move {
///     let email = payload["email"].as_str().ok_or_else(|| JobError::fatal("missing email"))?;
///     println!("sending welcome mail to {email}");
///     Ok::<_, JobError>(())
/// });
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &Value) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, payload: &Value) -> Result<(), JobError> {
        (self)(payload.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Welcome {
        #[allow(dead_code)]
        email: String,
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |payload: Value| async move {
            if payload["ok"].as_bool() == Some(true) {
                Ok(())
            } else {
                Err(JobError::retryable("not ok"))
            }
        };
        assert!(handler.handle(&json!({ "ok": true })).await.is_ok());
        assert!(!handler.handle(&json!({})).await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn malformed_payloads_are_fatal() {
        let handler = |payload: Value| async move {
            let _: Welcome = serde_json::from_value(payload)?;
            Ok::<_, JobError>(())
        };
        let err = handler.handle(&json!({ "name": "Ada" })).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
