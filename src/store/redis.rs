//! Redis-backed [`Store`].
//!
//! Layout per queue `name`:
//!
//! | Key                        | Type   | Contents                          |
//! |----------------------------|--------|-----------------------------------|
//! | `queue:{name}:job:{id}`    | hash   | one [`Job`], see below            |
//! | `queue:{name}:pending`     | list   | claimable job ids, oldest at head |
//! | `queue:{name}:processing`  | list   | ids currently claimed             |
//! | `queue:{name}:failed`      | list   | dead-lettered job ids             |
//!
//! A job hash holds `payload` (JSON), `enqueued_at` (RFC 3339), `attempts`,
//! `status` and, while claimed, `claimed_at`.
//!
//! Claiming is one Lua script: `LMOVE pending → processing` and the
//! `status`/`claimed_at` stamp happen together, so a claimed id is never
//! left in `processing` with a `pending` record. Status changes are a
//! compare-and-set script keyed on the status the caller saw.
//!
//! Retention: a job record moved to `Done` expires after the store's done
//! retention (24 hours unless [`RedisStore::with_done_retention`] says
//! otherwise; zero keeps them). `Failed` records never expire, so the
//! dead-letter list stays inspectable until an operator deletes them.
//!
//! Cache entries are stored with `SET key value EX ttl` under the caller's
//! key unchanged.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use serde_json::Value;

use super::{Store, StoreError, check_transition};
use crate::background::{Job, JobId, JobStatus};
use crate::config::StoreConfig;

/// How long `Done` job records are kept by default.
pub const DEFAULT_DONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// KEYS: pending, processing. ARGV: job key prefix, claimed_at.
static CLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if not id then
  return false
end
local key = ARGV[1] .. id
if redis.call('HGET', key, 'status') ~= 'pending' then
  redis.call('LREM', KEYS[2], 0, id)
  return {id, 0}
end
redis.call('HSET', key, 'status', 'processing', 'claimed_at', ARGV[2])
return {id, 1}
",
    )
});

// KEYS: job, pending, processing, failed.
// ARGV: id, expected status, new status, attempts, claimed_at, done retention secs.
static TRANSITION: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[3], 'attempts', ARGV[4])
if ARGV[2] == 'pending' then
  redis.call('LREM', KEYS[2], 0, ARGV[1])
elseif ARGV[2] == 'processing' then
  redis.call('LREM', KEYS[3], 0, ARGV[1])
end
if ARGV[3] == 'processing' then
  redis.call('HSET', KEYS[1], 'claimed_at', ARGV[5])
  redis.call('RPUSH', KEYS[3], ARGV[1])
else
  redis.call('HDEL', KEYS[1], 'claimed_at')
end
if ARGV[3] == 'pending' then
  redis.call('RPUSH', KEYS[2], ARGV[1])
elseif ARGV[3] == 'failed' then
  redis.call('RPUSH', KEYS[4], ARGV[1])
elseif ARGV[3] == 'done' and tonumber(ARGV[6]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[6])
end
return 1
",
    )
});

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

fn job_key(queue: &str, id: JobId) -> String {
    format!("queue:{queue}:job:{id}")
}

fn list_key(queue: &str, list: &str) -> String {
    format!("queue:{queue}:{list}")
}

fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>, StoreError> {
    let mut fields = vec![
        ("payload", serde_json::to_string(&job.payload)?),
        ("enqueued_at", job.enqueued_at.to_rfc3339()),
        ("attempts", job.attempts.to_string()),
        ("status", job.status.as_str().to_owned()),
    ];
    if let Some(claimed_at) = job.claimed_at {
        fields.push(("claimed_at", claimed_at.to_rfc3339()));
    }
    Ok(fields)
}

fn decode_job(id: JobId, mut fields: HashMap<String, String>) -> Result<Job, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptRecord { id, reason };
    let mut take = |name: &str| {
        fields
            .remove(name)
            .ok_or_else(|| corrupt(format!("missing `{name}`")))
    };

    let payload = serde_json::from_str::<Value>(&take("payload")?)?;
    let enqueued_at = parse_time(&take("enqueued_at")?).map_err(corrupt)?;
    let attempts = take("attempts")?
        .parse::<u32>()
        .map_err(|e| corrupt(format!("attempts: {e}")))?;
    let status = take("status")?
        .parse::<JobStatus>()
        .map_err(|e| corrupt(format!("{e}")))?;
    let claimed_at = match fields.remove("claimed_at") {
        Some(raw) => Some(parse_time(&raw).map_err(corrupt)?),
        None => None,
    };

    Ok(Job {
        id,
        payload,
        enqueued_at,
        attempts,
        status,
        claimed_at,
    })
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("timestamp `{raw}`: {e}"))
}

/// A [`Store`] over a single multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    done_retention: Duration,
}

impl RedisStore {
    /// Connects to the endpoint described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::connect_url(&config.url())
            .await?
            .with_done_retention(config.done_retention()))
    }

    /// Connects to a `redis://` URL.
    pub async fn connect_url(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(%url, "connected to redis store");
        Ok(Self {
            conn,
            done_retention: DEFAULT_DONE_RETENTION,
        })
    }

    /// How long a `Done` job record survives. Zero keeps it forever.
    pub fn with_done_retention(mut self, retention: Duration) -> Self {
        self.done_retention = retention;
        self
    }

    async fn load_job(&self, queue: &str, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(job_key(queue, id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(id, fields).map(Some)
    }

    /// Moves a job from `from` to `to` if it is still in `from`.
    async fn transition(
        &self,
        queue: &str,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        attempts: u32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let applied: i64 = TRANSITION
            .key(job_key(queue, id))
            .key(list_key(queue, "pending"))
            .key(list_key(queue, "processing"))
            .key(list_key(queue, "failed"))
            .arg(id.to_string())
            .arg(from.as_str())
            .arg(to.as_str())
            .arg(attempts)
            .arg(Utc::now().to_rfc3339())
            .arg(self.done_retention.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn forget_processing(&self, queue: &str, raw_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(list_key(queue, "processing"))
            .arg(0)
            .arg(raw_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(raw.map(Bytes::from))
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // EX takes whole seconds and rejects zero.
        let seconds = ttl.as_secs().max(1);
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value.as_ref())
            .arg("EX")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn enqueue(&self, queue: &str, job: &Job) -> Result<(), StoreError> {
        let fields = encode_job(job)?;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(job_key(queue, job.id))
            .arg(&fields)
            .ignore();
        match job.status {
            JobStatus::Pending => {
                pipe.cmd("RPUSH")
                    .arg(list_key(queue, "pending"))
                    .arg(job.id.to_string())
                    .ignore();
            }
            JobStatus::Failed => {
                pipe.cmd("RPUSH")
                    .arg(list_key(queue, "failed"))
                    .arg(job.id.to_string())
                    .ignore();
            }
            JobStatus::Processing | JobStatus::Done => {}
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let prefix = format!("queue:{queue}:job:");
        loop {
            let claimed: Option<(String, i64)> = CLAIM
                .key(list_key(queue, "pending"))
                .key(list_key(queue, "processing"))
                .arg(&prefix)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?;
            let Some((raw_id, found)) = claimed else {
                return Ok(None);
            };
            if found == 0 {
                tracing::warn!(queue, id = %raw_id, "pending id has no claimable job record, skipping");
                continue;
            }

            let Ok(id) = raw_id.parse::<JobId>() else {
                tracing::warn!(queue, id = %raw_id, "dropping malformed job id from processing list");
                self.forget_processing(queue, &raw_id).await?;
                continue;
            };
            match self.load_job(queue, id).await? {
                Some(job) => return Ok(Some(job)),
                None => {
                    self.forget_processing(queue, &raw_id).await?;
                }
            }
        }
    }

    async fn update_status(
        &self,
        queue: &str,
        id: JobId,
        status: JobStatus,
        attempts: u32,
    ) -> Result<(), StoreError> {
        let not_found = || StoreError::JobNotFound {
            queue: queue.to_owned(),
            id,
        };
        let job = self.load_job(queue, id).await?.ok_or_else(not_found)?;
        check_transition(&job, status, attempts)?;

        if self.transition(queue, id, job.status, status, attempts).await? {
            return Ok(());
        }
        // Another writer moved the job between the read and the write.
        let current = self.load_job(queue, id).await?.ok_or_else(not_found)?;
        Err(StoreError::InvalidTransition {
            id,
            from: current.status,
            to: status,
        })
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        visibility: Duration,
        max_attempts: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let Some(cutoff) = TimeDelta::from_std(visibility)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };

        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(list_key(queue, "processing"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut moved = Vec::new();
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<JobId>() else {
                self.forget_processing(queue, &raw_id).await?;
                continue;
            };
            let Some(mut job) = self.load_job(queue, id).await? else {
                self.forget_processing(queue, &raw_id).await?;
                continue;
            };
            if job.status != JobStatus::Processing {
                continue;
            }
            if job.claimed_at.is_some_and(|at| at > cutoff) {
                continue;
            }

            let (status, attempts) = job.abandoned(max_attempts);
            if self
                .transition(queue, id, JobStatus::Processing, status, attempts)
                .await?
            {
                job.status = status;
                job.attempts = attempts;
                job.claimed_at = None;
                moved.push(job);
            }
        }
        Ok(moved)
    }

    async fn job(&self, queue: &str, id: JobId) -> Result<Option<Job>, StoreError> {
        self.load_job(queue, id).await
    }

    async fn failed_jobs(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(list_key(queue, "failed"))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<JobId>() else {
                continue;
            };
            if let Some(job) = self.load_job(queue, id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}
