use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{CACHE_STATUS_HEADER, CacheConfig, CacheEntry, CacheKey, CacheStatus};
use crate::context::Context;
use crate::http::{Method, Response};
use crate::middleware::{Middleware, Next};
use crate::store::{Store, bounded};

/// Read-through cache layer for a route group.
///
/// # Behavior
///
/// - Non-`GET` requests are passed straight through and marked `MISS`.
/// - A `GET` with a live entry is answered from the store, marked `HIT`; the
///   downstream handler is not called.
/// - Otherwise the handler runs, its response is marked `MISS`, and a `200`
///   response is written back under the request's key. The write runs on a
///   spawned task: the response never waits for it and a failed write is
///   only logged.
/// - Store errors and timeouts on the read path count as a miss.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use readthru::cache::{CacheConfig, CacheInterceptor};
/// use readthru::store::MemoryStore;
///
/// let cache = CacheInterceptor::new(
///     Arc::new(MemoryStore::new()),
///     CacheConfig::new(Duration::from_secs(30)),
/// );
/// ```
pub struct CacheInterceptor {
    store: Arc<dyn Store>,
    config: Arc<CacheConfig>,
}

impl CacheInterceptor {
    pub fn new(store: Arc<dyn Store>, config: CacheConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Middleware for CacheInterceptor {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            if ctx.request().method() != &Method::Get {
                return mark(next.run(ctx).await, CacheStatus::Miss);
            }

            let key = CacheKey::for_request(ctx.request(), config.vary_headers());

            if let Some(entry) = lookup(store.as_ref(), &key, &config).await {
                debug!(key = %key, kind = ?entry.kind(), "cache hit");
                return mark(entry.into_response(), CacheStatus::Hit);
            }
            debug!(key = %key, "cache miss");

            let response = next.run(ctx).await;

            if let Some(entry) = CacheEntry::capture(key, &response, config.ttl()) {
                spawn_write(store, entry, config.timeout());
            }

            mark(response, CacheStatus::Miss)
        })
    }
}

fn mark(mut response: Response, status: CacheStatus) -> Response {
    response.set_header(CACHE_STATUS_HEADER, status.as_str());
    response
}

// Every failure mode on the read path degrades to a miss.
async fn lookup(store: &dyn Store, key: &CacheKey, config: &CacheConfig) -> Option<CacheEntry> {
    let raw = match bounded(config.timeout(), store.get(key.as_str())).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key = %key, error = %e, "cache read failed, treating as miss");
            return None;
        }
    };

    match CacheEntry::decode(key.clone(), &raw, config.ttl()) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(key = %key, error = %e, "undecodable cache entry, treating as miss");
            None
        }
    }
}

// Fire-and-forget: the caller never observes the outcome.
fn spawn_write(store: Arc<dyn Store>, entry: CacheEntry, timeout: std::time::Duration) {
    if entry.ttl.as_secs() == 0 {
        debug!(key = %entry.key, ttl = ?entry.ttl, "ttl below one second, skipping cache write");
        return;
    }

    tokio::spawn(async move {
        let value = match entry.encode() {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "failed to encode cache entry");
                return;
            }
        };

        match bounded(timeout, store.set_with_ttl(entry.key.as_str(), value, entry.ttl)).await {
            Ok(()) => debug!(key = %entry.key, ttl = ?entry.ttl, "cache entry stored"),
            Err(e) => warn!(key = %entry.key, error = %e, "cache write failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Request, StatusCode};
    use crate::router::{RouteGroup, Router};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cached_router(store: Arc<MemoryStore>, calls: Arc<AtomicUsize>) -> Router {
        let mut router = Router::new();
        router.mount(
            RouteGroup::new("/")
                .layer(CacheInterceptor::new(
                    store,
                    CacheConfig::new(Duration::from_secs(30)),
                ))
                .get("/items", move |_ctx| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Response::json(json!({ "items": ["a", "b"] })) }
                })
                .post("/items", |_ctx| async { Response::new(StatusCode::Created) }),
        );
        router
    }

    // Lets the detached write task run on the current-thread test runtime.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn second_get_is_a_hit() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let router = cached_router(Arc::clone(&store), Arc::clone(&calls));

        let first = router.route(Request::get("/items")).await;
        assert_eq!(CacheStatus::of(&first), Some(CacheStatus::Miss));
        settle().await;

        let second = router.route(Request::get("/items")).await;
        assert_eq!(CacheStatus::of(&second), Some(CacheStatus::Hit));
        assert!(matches!(second.body(), Body::Structured(_)));
        assert_eq!(second.body_bytes(), first.body_bytes());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_is_marked_miss_and_never_stored() {
        let store = Arc::new(MemoryStore::new());
        let router = cached_router(Arc::clone(&store), Arc::new(AtomicUsize::new(0)));

        let resp = router.route(Request::post("/items")).await;
        assert_eq!(resp.status(), StatusCode::Created);
        assert_eq!(CacheStatus::of(&resp), Some(CacheStatus::Miss));
        settle().await;

        assert!(store.get("cache:POST:/items").await.unwrap().is_none());
        assert!(store.get("cache:GET:/items").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_store_degrades_to_uncached_responses() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let router = cached_router(Arc::clone(&store), Arc::clone(&calls));

        for _ in 0..2 {
            let resp = router.route(Request::get("/items")).await;
            assert_eq!(resp.status(), StatusCode::Ok);
            assert_eq!(CacheStatus::of(&resp), Some(CacheStatus::Miss));
            settle().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_with_ttl("cache:GET:/items", "garbage".into(), Duration::from_secs(30))
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let router = cached_router(Arc::clone(&store), Arc::clone(&calls));

        let resp = router.route(Request::get("/items")).await;
        assert_eq!(CacheStatus::of(&resp), Some(CacheStatus::Miss));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sub_second_ttl_never_writes() {
        let store = Arc::new(MemoryStore::new());
        let mut router = Router::new();
        router.mount(
            RouteGroup::new("/")
                .layer(CacheInterceptor::new(
                    Arc::clone(&store) as Arc<dyn Store>,
                    CacheConfig::new(Duration::from_millis(500)),
                ))
                .get("/", |_ctx| async { Response::text("hi") }),
        );

        router.route(Request::get("/")).await;
        settle().await;
        assert!(store.get("cache:GET:/").await.unwrap().is_none());
    }
}
