//! The web front.
//!
//! A hyper HTTP/1.1 server exposing the ingestion endpoint and the
//! observability endpoints:
//!
//! - `POST /post/http` — submit one job or a batch (spec object or array)
//! - `GET /metrics` — Prometheus text exposition of all counters
//! - `GET /status` — JSON snapshot of pool occupancy
//!
//! Each listener runs its own accept loop; each connection is served in its
//! own task; each request handler runs in a task of its own so a panic
//! becomes an HTTP 500 instead of a dead connection or a dead process.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use outpost_metrics::{Counter, Registry};
use outpost_pool::{Pool, PoolError};

use crate::graceful::Listener;
use crate::ingest::{self, IngestError};

/// Maximum ingestion body size (10 MB), applied before decompression.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

struct AppState {
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    requests_in: Arc<Counter>,
}

/// The HTTP front serving ingestion and observability.
pub struct WebServer {
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WebServer {
    pub fn new(pool: Arc<Pool>, registry: Arc<Registry>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let requests_in = registry.counter("requests_in");
        Self {
            state: Arc::new(AppState {
                pool,
                registry,
                requests_in,
            }),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Runs an accept loop for `listener` until [`shutdown`](Self::shutdown).
    pub fn serve(&self, listener: Listener) -> JoinHandle<()> {
        match listener {
            Listener::Tcp(listener) => {
                let state = self.state.clone();
                let mut shutdown = self.shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => match accepted {
                                Ok((stream, _)) => spawn_connection(TokioIo::new(stream), state.clone()),
                                Err(err) => tracing::error!("failed to accept connection: {err}"),
                            },
                            _ = shutdown.changed() => break,
                        }
                    }
                })
            }
            Listener::Unix(listener) => {
                let state = self.state.clone();
                let mut shutdown = self.shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => match accepted {
                                Ok((stream, _)) => spawn_connection(TokioIo::new(stream), state.clone()),
                                Err(err) => tracing::error!("failed to accept connection: {err}"),
                            },
                            _ = shutdown.changed() => break,
                        }
                    }
                })
            }
        }
    }

    /// Stops every accept loop. In-flight connections finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn spawn_connection<I>(io: I, state: Arc<AppState>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |req: Request<Incoming>| {
            let state = state.clone();
            async move { handle_request(state, req).await }
        });
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!("error serving connection: {err}");
        }
    });
}

async fn handle_request<B>(
    state: Arc<AppState>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // The route runs in its own task: a panic surfaces as a join error and
    // becomes a 500 while the connection and the process live on.
    match tokio::spawn(route(state, req)).await {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::error!("panic in request handler: {err}");
            Ok(simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            ))
        }
    }
}

async fn route<B>(state: Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match (req.method().as_str(), req.uri().path()) {
        ("POST", "/post/http") => handle_post_http(state, req).await,
        ("GET", "/metrics") => handle_metrics(&state),
        ("GET", "/status") => handle_status(&state),
        #[cfg(test)]
        ("GET", "/__test/panic") => panic!("test panic"),
        _ => simple_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_post_http<B>(state: Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    state.requests_in.inc();

    // Refuse before parsing once shutdown has begun.
    if state.pool.is_closing() {
        return simple_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &PoolError::Closed.to_string(),
        );
    }

    let content_encoding = req
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase);

    let body = match Limited::new(req.into_body(), MAX_BODY_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return simple_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {err}"),
            )
        }
    };

    let result = ingest::decode_body(body.to_vec(), content_encoding.as_deref())
        .and_then(|decoded| ingest::parse_jobs(&decoded))
        .and_then(|roots| ingest::submit_all(&state.pool, roots));

    match result {
        Ok(()) => json_response(StatusCode::OK, serde_json::json!({"success": true})),
        Err(IngestError::BadRequest(reason)) => {
            simple_response(StatusCode::BAD_REQUEST, &reason)
        }
        Err(IngestError::Overloaded(reason)) => {
            simple_response(StatusCode::SERVICE_UNAVAILABLE, &reason)
        }
    }
}

fn handle_metrics(state: &AppState) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(state.registry.render())))
        .unwrap()
}

fn handle_status(state: &AppState) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "queueLimit": state.pool.queue_cap(),
            "workers": state.pool.size(),
            "activeWorkers": state.pool.active_workers(),
            "jobsInQueue": state.pool.queue_len(),
        }),
    )
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn simple_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
