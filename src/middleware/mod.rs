//! Middleware pipeline: composable layers around a route handler.
//!
//! Each middleware wraps the rest of the chain and may:
//!
//! - **Pass through**: call `next.run(ctx).await` unchanged.
//! - **Short-circuit**: return a [`Response`] without calling `next` (a cache
//!   hit does this).
//! - **Decorate**: call `next.run(ctx).await`, inspect or capture the
//!   response, and return a modified copy.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by every layer.
//! - [`Next`]: cursor into the remaining layers, ending in the route handler.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable layer.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`LoggerMiddleware`]: built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;

use crate::{Response, context::Context, router::Handler};

/// A type-erased, reference-counted middleware function.
///
/// The [`Arc`] wrapper makes layers cheap to clone so that [`Next`] can
/// advance through a shared stack without copying closures.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use readthru::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// Calling [`Next::run`] invokes the next layer, or the route handler once
/// every layer has been passed. `Next` is consumed by `run`, so a layer can
/// forward a request at most once.
pub struct Next {
    layers: Arc<[MiddlewareHandler]>,
    // Position of the layer the next `run` call invokes.
    index: usize,
    endpoint: Handler,
}

impl Next {
    /// Creates a cursor at the start of `layers`, terminating in `endpoint`.
    pub fn new(layers: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            layers,
            index: 0,
            endpoint,
        }
    }

    /// Invokes the next layer (or the endpoint) and returns its response.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.layers.get(self.index).cloned() {
            Some(layer) => {
                self.index += 1;
                layer(ctx, self).await
            }
            None => (self.endpoint)(ctx).await,
        }
    }
}

/// The core trait for all middleware.
///
/// # Contract
///
/// - Implementations must be `Send + Sync`; a layer is shared by every
///   request that passes through its route group.
/// - `handle` returns a pinned, `Send` future so it can be awaited on a
///   multi-threaded runtime.
/// - Implementations should not hold locks across an `.await` point.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Logs each request's method, path, status, cache status and duration.
///
/// Emits one `tracing::info!` record after the downstream chain completes.
/// Mount it outside the cache layer so the `X-Cache` marker is visible.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().to_string();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            let cache = response
                .headers()
                .get(crate::cache::CACHE_STATUS_HEADER)
                .unwrap_or("-")
                .to_owned();
            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                cache = %cache,
                elapsed = ?start.elapsed(),
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, StatusCode};
    use std::sync::Mutex;

    // Records its tag on the way in and out so ordering can be asserted.
    struct Trace {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Trace {
        fn handle(
            &self,
            ctx: Context,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let tag = self.tag;
            let log = Arc::clone(&self.log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("{tag}:in"));
                let resp = next.run(ctx).await;
                log.lock().unwrap().push(format!("{tag}:out"));
                resp
            })
        }
    }

    struct ShortCircuit;

    impl Middleware for ShortCircuit {
        fn handle(
            &self,
            _ctx: Context,
            _next: Next,
        ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(async { Response::new(StatusCode::TooManyRequests) })
        }
    }

    fn endpoint(log: Arc<Mutex<Vec<String>>>) -> Handler {
        crate::router::erase(move |_ctx: Context| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push("endpoint".to_owned());
                Response::text("done")
            }
        })
    }

    #[tokio::test]
    async fn empty_stack_runs_endpoint() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let next = Next::new(Arc::from(Vec::new()), endpoint(Arc::clone(&log)));
        let resp = next.run(Context::new(Request::get("/"))).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(*log.lock().unwrap(), vec!["endpoint"]);
    }

    #[tokio::test]
    async fn layers_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layers: Vec<MiddlewareHandler> = vec![
            from_middleware(Arc::new(Trace {
                tag: "outer",
                log: Arc::clone(&log),
            })),
            from_middleware(Arc::new(Trace {
                tag: "inner",
                log: Arc::clone(&log),
            })),
        ];
        let next = Next::new(Arc::from(layers), endpoint(Arc::clone(&log)));
        next.run(Context::new(Request::get("/"))).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:in", "inner:in", "endpoint", "inner:out", "outer:out"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layers: Vec<MiddlewareHandler> = vec![from_middleware(Arc::new(ShortCircuit))];
        let next = Next::new(Arc::from(layers), endpoint(Arc::clone(&log)));
        let resp = next.run(Context::new(Request::get("/"))).await;

        assert_eq!(resp.status(), StatusCode::TooManyRequests);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let layers: Vec<MiddlewareHandler> = vec![from_middleware(Arc::new(LoggerMiddleware))];
        let next = Next::new(Arc::from(layers), endpoint(Arc::clone(&log)));
        let resp = next.run(Context::new(Request::get("/"))).await;
        assert_eq!(&resp.body_bytes()[..], b"done");
    }
}
