//! # readthru
//!
//! A read-through response cache and a durable background task queue for
//! async request handlers, sharing one key-value store.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use readthru::background::{JobError, Producer, QueueConfig, Worker, shutdown_signal};
//! use readthru::cache::{CacheConfig, CacheInterceptor};
//! use readthru::context::Context;
//! use readthru::http::{Request, Response};
//! use readthru::router::{RouteGroup, Router};
//! use readthru::store::{MemoryStore, Store};
//! use serde_json::{Value, json};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let queue = QueueConfig::new("mail");
//! let producer = Producer::new(store.clone(), &queue);
//!
//! let mut router = Router::new();
//! router.mount(
//!     RouteGroup::new("/")
//!         .layer(CacheInterceptor::new(store.clone(), CacheConfig::new(Duration::from_secs(30))))
//!         .get("/", |_ctx| async { Response::html("<h1>Welcome</h1>") }),
//! );
//! router.post("/send-welcome", move |ctx: Context| {
//!     let producer = producer.clone();
//!     async move {
//!         let Ok(body) = ctx.json::<Value>() else {
//!             return Response::text("bad request").with_status(readthru::StatusCode::BadRequest);
//!         };
//!         match producer.enqueue(&body).await {
//!             Ok(id) => Response::json(json!({ "job": id.to_string() })),
//!             Err(_) => Response::text("queue unavailable")
//!                 .with_status(readthru::StatusCode::ServiceUnavailable),
//!         }
//!     }
//! });
//!
//! let (shutdown_tx, shutdown_rx) = shutdown_signal();
//! let workers = Worker::new(store.clone(), |_: Value| async { Ok::<_, JobError>(()) }, queue)
//!     .spawn(shutdown_rx);
//!
//! let page = router.route(Request::get("/")).await;
//! assert_eq!(page.headers().get("X-Cache"), Some("MISS"));
//!
//! shutdown_tx.send(true).ok();
//! workers.join().await;
//! # }
//! ```
//!
//! ## Layout
//!
//! - [`http`]: request and response model, including the typed response body
//! - [`context`], [`middleware`], [`router`]: the dispatch chain the cache
//!   plugs into
//! - [`store`]: the shared store interface and its backends
//! - [`cache`]: the read-through cache interceptor
//! - [`background`]: producer and worker for deferred jobs
//! - [`config`]: figment-backed settings

pub mod background;
pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod store;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{RouteGroup, Router};
