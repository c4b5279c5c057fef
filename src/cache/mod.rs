//! Read-through response cache.
//!
//! [`CacheInterceptor`] is a [`Middleware`](crate::middleware::Middleware)
//! that sits between a route group and its handlers. For a `GET` it first
//! looks up the stored representation of the request; on a hit the handler is
//! skipped entirely, on a miss the handler's response is captured and, if it
//! is a `200`, written back to the store in a detached task.
//!
//! Every response passing through carries an [`CACHE_STATUS_HEADER`] of
//! `HIT` or `MISS`.
//!
//! Concurrent misses for the same key are not coalesced: each one runs the
//! handler and each one writes, last write wins.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::http::{Body, Request, Response, StatusCode};

mod interceptor;
mod key;

pub use interceptor::CacheInterceptor;
pub use key::CacheKey;

/// Response header carrying the [`CacheStatus`].
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Whether a response was served from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }

    /// Reads the marker back off a response.
    pub fn of(response: &Response) -> Option<Self> {
        match response.headers().get(CACHE_STATUS_HEADER)? {
            "HIT" => Some(Self::Hit),
            "MISS" => Some(Self::Miss),
            _ => None,
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected cache settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    #[error("cache ttl must be at least one second")]
    ZeroTtl,
}

/// Per-mount cache settings.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use readthru::cache::CacheConfig;
///
/// let config = CacheConfig::new(Duration::from_secs(30))
///     .vary_by("X-Tenant")
///     .store_timeout(Duration::from_millis(250));
/// assert_eq!(config.ttl(), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    ttl: Duration,
    store_timeout: Duration,
    vary_by: Vec<String>,
}

impl CacheConfig {
    /// Default bound on a single store read or write.
    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Cache entries written by this mount live for `ttl`.
    ///
    /// Stores expire at whole-second granularity; a TTL under one second
    /// disables writes for the mount.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            store_timeout: Self::DEFAULT_STORE_TIMEOUT,
            vary_by: Vec::new(),
        }
    }

    /// Builds a config from a whole number of seconds, as it appears in
    /// configuration files.
    pub fn from_secs(ttl_secs: u64) -> Result<Self, CacheConfigError> {
        if ttl_secs == 0 {
            return Err(CacheConfigError::ZeroTtl);
        }
        Ok(Self::new(Duration::from_secs(ttl_secs)))
    }

    /// Bounds each store read and write. A timed-out read is a miss, a
    /// timed-out write is dropped.
    #[must_use]
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Folds the value of request header `name` into the cache key, so
    /// requests differing in that header never share an entry. Use it for
    /// tenant or identity headers on multi-tenant routes.
    #[must_use]
    pub fn vary_by(mut self, name: impl Into<String>) -> Self {
        self.vary_by.push(name.into());
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn vary_headers(&self) -> &[String] {
        &self.vary_by
    }
}

/// Which output operation produced a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Structured,
    Text,
}

/// A captured payload, tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    Structured(Value),
    Text(String),
}

impl CachedPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Structured(_) => PayloadKind::Structured,
            Self::Text(_) => PayloadKind::Text,
        }
    }
}

// The persisted form of a cached response. Text payloads are stored as JSON
// strings.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    kind: PayloadKind,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

/// One cached response representation.
///
/// Only successful (`200`) responses to `GET` requests become entries. An
/// entry is never mutated; writing the same key again replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: CachedPayload,
    pub content_type: Option<String>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Captures `response` for storage under `key`.
    ///
    /// Returns `None` for anything that must not be stored: non-`200`
    /// statuses, empty bodies and text bodies that are not valid UTF-8.
    pub fn capture(key: CacheKey, response: &Response, ttl: Duration) -> Option<Self> {
        if response.status() != StatusCode::Ok {
            return None;
        }
        let payload = match response.body() {
            Body::Empty => return None,
            Body::Structured(value) => CachedPayload::Structured(value.clone()),
            Body::Text(bytes) => CachedPayload::Text(String::from_utf8(bytes.to_vec()).ok()?),
        };
        Some(Self {
            key,
            payload,
            content_type: response.content_type().map(str::to_owned),
            ttl,
        })
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    /// Encodes the entry as stored: `{"kind", "payload", "content_type"}`.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let payload = match &self.payload {
            CachedPayload::Structured(value) => value.clone(),
            CachedPayload::Text(text) => Value::String(text.clone()),
        };
        let stored = StoredEntry {
            kind: self.kind(),
            payload,
            content_type: self.content_type.clone(),
        };
        serde_json::to_vec(&stored).map(Bytes::from)
    }

    /// Decodes a stored value read back under `key`.
    pub fn decode(key: CacheKey, raw: &[u8], ttl: Duration) -> Result<Self, serde_json::Error> {
        let stored: StoredEntry = serde_json::from_slice(raw)?;
        let payload = match (stored.kind, stored.payload) {
            (PayloadKind::Structured, value) => CachedPayload::Structured(value),
            (PayloadKind::Text, Value::String(text)) => CachedPayload::Text(text),
            (PayloadKind::Text, _) => {
                return Err(serde::de::Error::custom("text payload must be a string"));
            }
        };
        Ok(Self {
            key,
            payload,
            content_type: stored.content_type,
            ttl,
        })
    }

    /// Rebuilds the response the handler originally produced.
    pub fn into_response(self) -> Response {
        let (body, default_type) = match self.payload {
            CachedPayload::Structured(value) => (Body::Structured(value), "application/json"),
            CachedPayload::Text(text) => (Body::Text(Bytes::from(text)), "text/plain; charset=utf-8"),
        };
        let content_type = self.content_type.as_deref().unwrap_or(default_type);
        Response::new(StatusCode::Ok)
            .header(crate::http::response::CONTENT_TYPE, content_type)
            .with_body(body)
    }
}

/// Convenience for building a key outside the interceptor, e.g. to inspect
/// or pre-warm the store.
pub fn key_for(request: &Request, config: &CacheConfig) -> CacheKey {
    CacheKey::for_request(request, config.vary_headers())
}
