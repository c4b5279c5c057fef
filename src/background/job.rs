//! Job descriptors and their status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier assigned to a job when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Pending ──claim──▶ Processing ──ok──────────────▶ Done
///    ▲                   │
///    └───retry───────────┤
///                        └──attempts exhausted──▶ Failed
/// ```
///
/// `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether a job in this state may move to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Done)
                | (Self::Processing, Self::Pending)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status `{0}`")]
pub struct UnknownStatus(String);

impl std::str::FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// One unit of deferred work.
///
/// The payload is opaque to the queue; only the registered task handler
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: JobStatus,
    /// When the current claim was taken. Set only while `Processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh `Pending` job with no attempts.
    pub fn new(payload: Value) -> Self {
        Self {
            id: JobId::new(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            status: JobStatus::Pending,
            claimed_at: None,
        }
    }

    /// The state a claim abandoned by its worker resolves to.
    ///
    /// The lost claim counts as an attempt, since the handler may have run.
    /// A job that reaches `max_attempts` this way is dead-lettered.
    pub fn abandoned(&self, max_attempts: u32) -> (JobStatus, u32) {
        let attempts = self.attempts + 1;
        if attempts >= max_attempts {
            (JobStatus::Failed, attempts)
        } else {
            (JobStatus::Pending, attempts)
        }
    }
}
