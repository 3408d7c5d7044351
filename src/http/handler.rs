//! Main axum router and HTTP request handlers for the edge node.
//!
//! Routes:
//! - `GET /{image_type}/{chapter_hash}/{image_filename}`          - Image
//! - `GET /{token}/{image_type}/{chapter_hash}/{image_filename}`  - Image (token ignored)
//! - `GET /metrics`                                               - Prometheus metrics

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::{Bytes, BytesMut};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use super::image_path::CacheKey;
use crate::metrics::CacheOutcome;
use crate::AppState;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_TIME_TAKEN: HeaderName = HeaderName::from_static("x-time-taken");

/// Chunks buffered between the origin reader and the client body.
const TEE_CHANNEL_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/{image_type}/{chapter_hash}/{image_filename}",
            get(handle_image),
        )
        .route(
            "/{token}/{image_type}/{chapter_hash}/{image_filename}",
            get(handle_tokenized_image),
        )
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request policy
// ---------------------------------------------------------------------------

/// CORS and referer handling derived from the embedding site's origin.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    allow_origin: HeaderValue,
    chapter_referer: Regex,
}

impl RequestPolicy {
    pub fn new(allowed_origin: &str) -> anyhow::Result<Self> {
        let origin = allowed_origin.trim_end_matches('/');
        let allow_origin = HeaderValue::from_str(origin)
            .with_context(|| format!("invalid allowed origin: {origin:?}"))?;
        let chapter_referer = Regex::new(&format!("{}/chapter/[0-9]+", regex::escape(origin)))
            .context("failed to build referer pattern")?;
        Ok(Self {
            allow_origin,
            chapter_referer,
        })
    }

    /// `"None"` when absent; a chapter URL on the embedding site is cut down
    /// to the matched part; anything else is kept as sent.
    pub fn normalize_referer(&self, raw: Option<&HeaderValue>) -> String {
        let Some(raw) = raw else {
            return "None".to_string();
        };
        let referer = String::from_utf8_lossy(raw.as_bytes());
        match self.chapter_referer.find(&referer) {
            Some(m) => m.as_str().to_string(),
            None => referer.into_owned(),
        }
    }

    fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("*"),
        );
        headers
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{image_type}/{chapter_hash}/{image_filename}`
async fn handle_image(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((image_type, chapter_hash, image_filename)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    serve_image(state, remote, &image_type, &chapter_hash, &image_filename, &headers).await
}

/// `GET /{token}/{image_type}/{chapter_hash}/{image_filename}`
async fn handle_tokenized_image(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((_token, image_type, chapter_hash, image_filename)): Path<(
        String,
        String,
        String,
        String,
    )>,
    headers: HeaderMap,
) -> Response {
    serve_image(state, remote, &image_type, &chapter_hash, &image_filename, &headers).await
}

/// Per-request context carried into the hit/miss paths.
struct ImageRequest {
    key: CacheKey,
    remote: SocketAddr,
    referer: String,
    started: Instant,
}

impl ImageRequest {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

async fn serve_image(
    state: Arc<AppState>,
    remote: SocketAddr,
    image_type: &str,
    chapter_hash: &str,
    image_filename: &str,
    headers: &HeaderMap,
) -> Response {
    let started = Instant::now();
    let referer = state.policy.normalize_referer(headers.get(header::REFERER));

    let key = match CacheKey::from_tokens(image_type, chapter_hash, image_filename) {
        Ok(key) => key,
        Err(e) => {
            info!(%remote, %referer, error = %e, "rejected malformed image request");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    info!(
        key = %key,
        image_type = key.image_type().as_str(),
        %remote,
        %referer,
        "request received"
    );

    if headers.contains_key(header::IF_MODIFIED_SINCE) {
        info!(key = %key, %remote, %referer, "request cached by browser");
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let req = ImageRequest {
        key,
        remote,
        referer,
        started,
    };

    let cached = match state.cache.get(req.key.as_str()).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(key = %req.key, error = %format!("{e:#}"), "cache lookup failed; treating as miss");
            None
        }
    };

    match cached {
        Some(blob) => serve_hit(&state, &req, &blob),
        None => serve_miss(state, req).await,
    }
}

fn serve_hit(state: &AppState, req: &ImageRequest, blob: &Bytes) -> Response {
    // The engine may hand out a buffer it keeps reusing.
    let body = Bytes::copy_from_slice(blob);

    let mut headers = state.policy.response_headers();
    headers.insert(X_CACHE, HeaderValue::from_static(CacheOutcome::Hit.header_value()));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(req.key.content_type()),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    let elapsed_ms = req.elapsed_ms();
    headers.insert(X_TIME_TAKEN, HeaderValue::from(elapsed_ms));
    info!(key = %req.key, remote = %req.remote, referer = %req.referer, "request hit cache");
    info!(key = %req.key, elapsed_ms, "request processed");

    state.lifecycle.mark_request();
    state.metrics.record(CacheOutcome::Hit, elapsed_ms as f64);

    (StatusCode::OK, headers, body).into_response()
}

async fn serve_miss(state: Arc<AppState>, req: ImageRequest) -> Response {
    let mut headers = state.policy.response_headers();
    headers.insert(X_CACHE, HeaderValue::from_static(CacheOutcome::Miss.header_value()));

    let url = state.assignment.load().origin_url(req.key.as_str());
    info!(key = %req.key, remote = %req.remote, referer = %req.referer, "request missed cache");

    let upstream = match state.origin.fetch(&url).await {
        Ok(resp) => resp,
        Err(e) => {
            let status = e.response_status();
            warn!(
                key = %req.key,
                remote = %req.remote,
                referer = %req.referer,
                %url,
                error = %e,
                "origin fetch failed"
            );
            let elapsed_ms = req.elapsed_ms();
            headers.insert(X_TIME_TAKEN, HeaderValue::from(elapsed_ms));
            state.lifecycle.mark_request();
            state.metrics.record(CacheOutcome::Miss, elapsed_ms as f64);
            return (status, headers).into_response();
        }
    };

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(req.key.content_type()));
    headers.insert(header::CONTENT_TYPE, content_type);
    // No Content-Length on a miss; the body is polled until the tee task
    // closes it.
    let length_hint = upstream.content_length();

    // Headers leave before the body, so this is the dispatch time; the total
    // is logged once the body has been delivered.
    let elapsed_ms = req.elapsed_ms();
    headers.insert(X_TIME_TAKEN, HeaderValue::from(elapsed_ms));
    info!(key = %req.key, elapsed_ms, "request processed");

    let (tx, rx) = mpsc::channel(TEE_CHANNEL_DEPTH);
    tokio::spawn(tee_and_store(state, req, upstream, length_hint, tx));

    (StatusCode::OK, headers, Body::from_stream(ReceiverStream::new(rx))).into_response()
}

/// Forward the origin body to the client while buffering it, then store the
/// buffer.  A body that was not fully delivered is never stored.
///
/// A successful send only means the chunk was queued.  Before storing, the
/// task waits until the client body has taken every queued chunk; the
/// receiver being dropped first means the client went away.
async fn tee_and_store(
    state: Arc<AppState>,
    req: ImageRequest,
    upstream: reqwest::Response,
    length_hint: Option<u64>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let mut buffer = BytesMut::with_capacity(length_hint.unwrap_or(0).min(16 * 1024 * 1024) as usize);
    let mut stream = upstream.bytes_stream();
    let mut delivered = true;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                buffer.extend_from_slice(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(key = %req.key, remote = %req.remote, "client went away; not caching");
                    delivered = false;
                    break;
                }
            }
            Err(e) => {
                warn!(
                    key = %req.key,
                    remote = %req.remote,
                    referer = %req.referer,
                    error = %e,
                    "origin body failed mid-stream; not caching"
                );
                let _ = tx.send(Err(io::Error::other(e))).await;
                delivered = false;
                break;
            }
        }
    }

    if delivered && tx.reserve_many(TEE_CHANNEL_DEPTH).await.is_err() {
        debug!(key = %req.key, remote = %req.remote, "client went away before the body drained; not caching");
        delivered = false;
    }

    // Store before closing the client body so a follow-up request hits.
    if delivered {
        if let Err(e) = state.cache.set(req.key.as_str(), buffer.freeze()).await {
            warn!(key = %req.key, error = %format!("{e:#}"), "failed to store image; served uncached");
        }
    }
    drop(tx);

    let elapsed_ms = req.elapsed_ms();
    info!(key = %req.key, elapsed_ms, delivered, "request completed");
    state.lifecycle.mark_request();
    state.metrics.record(CacheOutcome::Miss, elapsed_ms as f64);
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
