//! Welcome-mail scenario, driven in-process.
//!
//! `GET /` is served through a 30-second read-through cache; `POST
//! /send-welcome` enqueues a mail job and answers immediately while a worker
//! pool delivers the mail through a mock sender.
//!
//! ```bash
//! RUST_LOG=readthru=debug,welcome_mail=info cargo run --example welcome_mail
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use readthru::background::{JobError, Producer, Worker, shutdown_signal};
use readthru::cache::{CacheInterceptor, CacheStatus};
use readthru::config::Config;
use readthru::context::Context;
use readthru::middleware::LoggerMiddleware;
use readthru::router::{RouteGroup, Router};
use readthru::store::{MemoryStore, Store};
use readthru::{Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct WelcomeMail {
    email: String,
    name: String,
}

/// Stands in for an SMTP relay: addresses on `bounce.test` always fail, and
/// every address fails its first delivery.
#[derive(Default)]
struct MockMailer {
    attempts: Mutex<HashMap<String, u32>>,
}

impl MockMailer {
    async fn send(&self, mail: WelcomeMail) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        if mail.email.ends_with("@bounce.test") {
            return Err(JobError::retryable(format!("{} bounced", mail.email)));
        }
        let tries = {
            let mut attempts = self.attempts.lock();
            let n = attempts.entry(mail.email.clone()).or_default();
            *n += 1;
            *n
        };
        if tries == 1 {
            return Err(JobError::retryable("relay timeout"));
        }

        tracing::info!(to = %mail.email, name = %mail.name, "welcome mail sent");
        Ok(())
    }
}

fn app(store: Arc<dyn Store>, config: &Config, producer: Producer) -> Result<Router, Box<dyn std::error::Error>> {
    let mut router = Router::new();
    router.layer(LoggerMiddleware);

    router.mount(
        RouteGroup::new("/")
            .layer(CacheInterceptor::new(store, config.cache_config()?))
            .get("/", |_ctx| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Response::html("<h1>Welcome</h1><p>Sign up to get a welcome mail.</p>")
            }),
    );

    router.post("/send-welcome", move |ctx: Context| {
        let producer = producer.clone();
        async move {
            let payload: Value = match ctx.json() {
                Ok(payload) => payload,
                Err(e) => {
                    return Response::json(json!({ "error": e.to_string() }))
                        .with_status(StatusCode::BadRequest);
                }
            };
            match producer.enqueue(&payload).await {
                Ok(id) => Response::json(json!({ "queued": id.to_string() }))
                    .with_status(StatusCode::Accepted),
                Err(e) => {
                    tracing::error!(error = %e, "could not queue welcome mail");
                    Response::json(json!({ "error": "mail queue unavailable" }))
                        .with_status(StatusCode::ServiceUnavailable)
                }
            }
        }
    });

    Ok(router)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;
    let queue = readthru::background::QueueConfig {
        name: "mail".to_owned(),
        poll_interval: Duration::from_millis(100),
        concurrency: 2,
        ..config.queue_config()
    };

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let producer = Producer::new(store.clone(), &queue);
    let router = app(store.clone(), &config, producer)?;

    let mailer = Arc::new(MockMailer::default());
    let handler = move |payload: Value| {
        let mailer = mailer.clone();
        async move {
            let mail: WelcomeMail = serde_json::from_value(payload)?;
            mailer.send(mail).await
        }
    };
    let (shutdown_tx, shutdown_rx) = shutdown_signal();
    let workers = Worker::new(store.clone(), handler, queue.clone()).spawn(shutdown_rx);

    for attempt in 1..=2 {
        let started = tokio::time::Instant::now();
        let page = router.route(Request::get("/")).await;
        tracing::info!(
            attempt,
            cache = %CacheStatus::of(&page).map_or("-", CacheStatus::as_str),
            elapsed = ?started.elapsed(),
            "GET /"
        );
        // Let the detached cache write land.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for body in [
        json!({ "email": "ada@example.com", "name": "Ada" }),
        json!({ "email": "nobody@bounce.test", "name": "Nobody" }),
        json!({ "name": "no address" }),
    ] {
        let request = Request::post("/send-welcome").with_body(body.to_string());
        let response = router.route(request).await;
        tracing::info!(status = %response.status(), body = ?response.body_bytes(), "POST /send-welcome");
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    for job in store.failed_jobs(&queue.name).await? {
        tracing::warn!(job_id = %job.id, attempts = job.attempts, payload = %job.payload, "dead-lettered");
    }

    shutdown_tx.send(true).ok();
    workers.join().await;
    Ok(())
}
