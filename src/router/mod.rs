//! Request routing: map methods and URL patterns to handlers, with
//! per-group middleware.
//!
//! Three pattern styles are supported:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths.
//! Routes are matched in registration order; the first match wins.
//!
//! Routes that share middleware are declared in a [`RouteGroup`] and
//! installed with [`Router::mount`]. This is where a dispatch layer decides
//! which routes pass through the response cache and with which TTL:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use readthru::{Response, Router, RouteGroup};
//! use readthru::cache::{CacheConfig, CacheInterceptor};
//! use readthru::store::MemoryStore;
//!
//! # async fn wire() {
//! let store = Arc::new(MemoryStore::new());
//! let pages = RouteGroup::new("/")
//!     .layer(CacheInterceptor::new(store.clone(), CacheConfig::new(Duration::from_secs(30))))
//!     .get("/", |_ctx| async { Response::html("<h1>home</h1>") });
//!
//! let mut router = Router::new();
//! router.mount(pages);
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased async handler that turns a [`Context`] into a [`Response`].
///
/// You rarely build one directly; [`Router`] and [`RouteGroup`] accept any
/// [`IntoHandler`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// Erase the concrete handler type.
pub(crate) fn erase(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| handler.call(ctx))
}

// A single path segment, either a literal or a named capture (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    // Any path under the prefix, e.g. `/files/*`.
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

// Joins a group prefix and a route path into one pattern string.
fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{path}"),
        (false, true) => prefix.to_owned(),
        (false, false) => format!("{prefix}/{path}"),
    }
}

impl Pattern {
    // Classified in order: trailing `/*` → wildcard, any `:` → parameterized,
    // otherwise exact.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_owned());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_owned()),
                    None => Segment::Static(s.to_owned()),
                })
                .collect();
            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_owned())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if parts.len() != segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (segment, part) in segments.iter().zip(parts) {
                    match segment {
                        Segment::Static(s) if s != part => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => params.insert(name.clone(), part.to_owned()),
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => {
                let suffix = path.strip_prefix(prefix.as_str())?;
                if !suffix.is_empty() && !suffix.starts_with('/') {
                    return None;
                }
                let mut params = PathParams::new();
                params.insert("wildcard".to_owned(), suffix.to_owned());
                Some(params)
            }
        }
    }
}

// A registered route with the layers of the group it was mounted from.
struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
    layers: Arc<[MiddlewareHandler]>,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        if &self.method == method {
            self.pattern.matches(path)
        } else {
            None
        }
    }
}

/// A set of routes under a common prefix that share middleware layers.
///
/// Layers run in the order they were added, outermost first, and apply only
/// to the routes of this group.
pub struct RouteGroup {
    prefix: String,
    layers: Vec<MiddlewareHandler>,
    routes: Vec<(Method, String, Handler)>,
}

impl RouteGroup {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            layers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Adds a middleware layer to every route in this group.
    #[must_use]
    pub fn layer<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.layers.push(from_middleware(Arc::new(middleware)));
        self
    }

    #[must_use]
    pub fn route(mut self, method: Method, path: &str, handler: impl IntoHandler) -> Self {
        let pattern = join_path(&self.prefix, path);
        self.routes.push((method, pattern, erase(handler)));
        self
    }

    #[must_use]
    pub fn get(self, path: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::Get, path, handler)
    }

    #[must_use]
    pub fn post(self, path: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::Post, path, handler)
    }

    #[must_use]
    pub fn put(self, path: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::Put, path, handler)
    }

    #[must_use]
    pub fn patch(self, path: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::Patch, path, handler)
    }

    #[must_use]
    pub fn delete(self, path: &str, handler: impl IntoHandler) -> Self {
        self.route(Method::Delete, path, handler)
    }
}

/// HTTP request router.
///
/// Global layers added with [`Router::layer`] wrap every request, including
/// unmatched ones (which end in `404 Not Found`). Group layers wrap only the
/// routes of their group and run inside the global ones.
///
/// # Examples
///
/// ```rust
/// use readthru::{Request, Response, Router, StatusCode};
/// use readthru::context::Context;
///
/// # async fn example() {
/// let mut router = Router::new();
/// router.get("/users/:id", |ctx: Context| async move {
///     let id = ctx.params().get("id").unwrap_or("unknown").to_owned();
///     Response::text(id)
/// });
///
/// let response = router.route(Request::get("/users/42")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
pub struct Router {
    layers: Vec<MiddlewareHandler>,
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Adds a layer that wraps every request the router dispatches.
    pub fn layer<M: Middleware + 'static>(&mut self, middleware: M) {
        self.layers.push(from_middleware(Arc::new(middleware)));
    }

    /// Installs every route of `group`, carrying the group's layers with them.
    pub fn mount(&mut self, group: RouteGroup) {
        let layers: Arc<[MiddlewareHandler]> = Arc::from(group.layers);
        for (method, pattern, handler) in group.routes {
            self.routes.push(Route {
                method,
                pattern: Pattern::parse(&pattern),
                handler,
                layers: Arc::clone(&layers),
            });
        }
    }

    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    pub fn put(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Put, path, handler);
    }

    pub fn patch(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Patch, path, handler);
    }

    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Delete, path, handler);
    }

    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler: erase(handler),
            layers: Arc::from(Vec::new()),
        });
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `request` through the matching route's middleware stack.
    pub async fn route(&self, request: Request) -> Response {
        let matched = self
            .routes
            .iter()
            .find_map(|route| Some((route, route.matches(request.method(), request.path())?)));

        let (ctx, route_layers, endpoint) = match matched {
            Some((route, params)) => (
                Context::with_params(request, params),
                Some(&route.layers),
                Arc::clone(&route.handler),
            ),
            None => (Context::new(request), None, erase(not_found)),
        };

        let stack: Arc<[MiddlewareHandler]> = self
            .layers
            .iter()
            .chain(route_layers.into_iter().flat_map(|layers| layers.iter()))
            .cloned()
            .collect();

        Next::new(stack, endpoint).run(ctx).await
    }
}

async fn not_found(_ctx: Context) -> Response {
    Response::new(StatusCode::NotFound)
}
