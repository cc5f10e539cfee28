//! Request pipeline
//!
//! resolve (404) -> availability (503) -> authenticate (401) -> read body
//! (413 over the limit) and build the upstream request (400) -> send (502)
//! -> relay.
//!
//! Only the wait for upstream response headers is bounded by the request
//! timeout. Once headers arrive the body is relayed chunk by chunk for as long
//! as the upstream keeps it open, which is what keeps SSE streams alive.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use pin_project_lite::pin_project;
use provider::headers::{sanitize_for_log, strip_hop_by_hop};
use provider::{DownstreamRequest, ProviderError, Registry};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::metrics;
use crate::service::ServiceMetrics;

/// Largest chunk handed to the client in one write.
const RELAY_CHUNK_BYTES: usize = 32 * 1024;

/// Cap on the upstream error body kept for the diagnostic log.
const ERROR_BODY_CAPTURE_BYTES: usize = 4096;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<Registry>,
    pub authenticator: Arc<Authenticator>,
    pub client: reqwest::Client,
    /// Time allowed for upstream response headers.
    pub request_timeout: Duration,
    pub max_request_body_bytes: usize,
    pub metrics: ServiceMetrics,
}

enum BodyError {
    TooLarge,
    Read(axum::Error),
}

/// Buffer the request body, refusing more than `limit` bytes.
async fn read_body(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(BodyError::Read)?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// JSON error body: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
pub fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Proxy one downstream request to the provider owning its path prefix.
pub async fn proxy_request(
    state: &ProxyState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut log = AccessLog::begin(
        &state.metrics,
        remote,
        request.method().as_str(),
        request.uri().path(),
        request_id.clone(),
    );

    debug!(
        request_id = %request_id,
        headers = ?sanitize_for_log(request.headers()),
        "inbound request"
    );

    let path = request.uri().path().to_string();
    let Some(route) = state.registry.resolve(&path) else {
        return log.reject(StatusCode::NOT_FOUND, "no provider for path");
    };
    let provider = Arc::clone(route.provider);
    let trimmed_path = route.trimmed_path;
    log.provider = provider.id().to_string();

    if !provider.is_available().await {
        warn!(request_id = %request_id, provider = provider.id(), "provider credentials unavailable");
        return log.reject(StatusCode::SERVICE_UNAVAILABLE, "provider unavailable");
    }

    let caller = match state
        .authenticator
        .authorize(request.headers().get(header::AUTHORIZATION))
        .await
    {
        Ok(caller) => caller,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "rejected downstream credentials");
            let mut response = log.reject(StatusCode::UNAUTHORIZED, "unauthorized");
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
            return response;
        }
    };
    log.user = caller.name().to_string();

    let (parts, body) = request.into_parts();
    let body = match read_body(body, state.max_request_body_bytes).await {
        Ok(b) => b,
        Err(BodyError::TooLarge) => {
            warn!(request_id = %request_id, limit = state.max_request_body_bytes, "request body too large");
            return log.reject(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(BodyError::Read(e)) => {
            error!(request_id = %request_id, error = %e, "failed to read request body");
            return log.reject(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    let downstream = DownstreamRequest {
        method: parts.method,
        headers: parts.headers,
        query: parts.uri.query().map(str::to_string),
        body,
    };
    let upstream = match provider
        .build_upstream_request(&downstream, &trimmed_path)
        .await
    {
        Ok(upstream) => upstream,
        // The token can expire between the availability check and here.
        Err(ProviderError::Unavailable(id)) => {
            warn!(request_id = %request_id, provider = %id, "credentials expired while building request");
            return log.reject(StatusCode::SERVICE_UNAVAILABLE, "provider unavailable");
        }
        Err(e) => {
            error!(request_id = %request_id, provider = provider.id(), error = %e, "failed to build upstream request");
            return log.reject(StatusCode::BAD_REQUEST, "invalid request");
        }
    };

    log.upstream_host = upstream.url.host_str().unwrap_or("-").to_string();
    debug!(
        request_id = %request_id,
        url = %upstream.url,
        headers = ?sanitize_for_log(&upstream.headers),
        "upstream request"
    );

    let send = state
        .client
        .request(upstream.method, upstream.url)
        .headers(upstream.headers)
        .body(upstream.body)
        .send();

    let upstream_response = match tokio::time::timeout(state.request_timeout, send).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let kind = classify(&e);
            metrics::record_upstream_error(&log.provider, kind);
            error!(request_id = %request_id, provider = %log.provider, error = %e, error_type = kind, "upstream request failed");
            return log.reject(StatusCode::BAD_GATEWAY, "upstream error");
        }
        Err(_) => {
            metrics::record_upstream_error(&log.provider, "timeout");
            error!(
                request_id = %request_id,
                provider = %log.provider,
                timeout_ms = state.request_timeout.as_millis() as u64,
                "timed out waiting for upstream response headers"
            );
            return log.reject(StatusCode::BAD_GATEWAY, "upstream timeout");
        }
    };

    relay(upstream_response, log)
}

/// Turn the upstream response into the downstream one, streaming the body.
fn relay(upstream: reqwest::Response, mut log: AccessLog) -> Response {
    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());
    let streaming = is_event_stream(&headers);

    log.status = status.as_u16();
    if status.as_u16() >= 400 && !streaming {
        log.error_capture = Some(ErrorCapture {
            body: Vec::new(),
            truncated: false,
            headers: sanitize_for_log(&headers),
        });
    }
    debug!(request_id = %log.request_id, status = log.status, streaming, "relaying upstream response");

    let stream = RelayStream {
        inner: upstream.bytes_stream(),
        pending: Bytes::new(),
        log: Some(log),
    };
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("text/event-stream"))
}

fn classify(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection"
    } else {
        "other"
    }
}

/// First bytes of an upstream error body, plus its sanitized headers.
struct ErrorCapture {
    body: Vec<u8>,
    truncated: bool,
    headers: Vec<(String, String)>,
}

impl ErrorCapture {
    fn push(&mut self, chunk: &[u8]) {
        let room = ERROR_BODY_CAPTURE_BYTES.saturating_sub(self.body.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.body).into_owned();
        if self.truncated {
            text.push_str(" ... (truncated)");
        }
        text
    }
}

/// Per-request access log entry.
///
/// Emitted exactly once, when dropped: immediately for rejected requests, at
/// end of body (or client disconnect) for relayed ones.
struct AccessLog {
    remote: String,
    method: String,
    path: String,
    user: String,
    provider: String,
    upstream_host: String,
    request_id: String,
    status: u16,
    bytes: u64,
    started: Instant,
    error_capture: Option<ErrorCapture>,
    metrics: ServiceMetrics,
}

impl AccessLog {
    fn begin(
        metrics: &ServiceMetrics,
        remote: String,
        method: &str,
        path: &str,
        request_id: String,
    ) -> Self {
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            remote,
            method: method.to_string(),
            path: path.to_string(),
            user: "anonymous".to_string(),
            provider: "-".to_string(),
            upstream_host: "-".to_string(),
            request_id,
            status: 0,
            bytes: 0,
            started: Instant::now(),
            error_capture: None,
            metrics: metrics.clone(),
        }
    }

    /// Answer with a proxy error and close out the entry.
    fn reject(mut self, status: StatusCode, message: &str) -> Response {
        self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        let response = error_response(status, message, &self.request_id);
        self.status = status.as_u16();
        self.bytes = axum::body::HttpBody::size_hint(response.body())
            .exact()
            .unwrap_or(0);
        response
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();

        if let Some(capture) = &self.error_capture {
            warn!(
                request_id = %self.request_id,
                provider = %self.provider,
                status = self.status,
                headers = ?capture.headers,
                body = %capture.text(),
                "upstream error response"
            );
        }

        info!(
            event = "request",
            remote = %self.remote,
            method = %self.method,
            path = %self.path,
            user = %self.user,
            provider = %self.provider,
            status = self.status,
            bytes = self.bytes,
            duration_ms = elapsed.as_millis() as u64,
            upstream_host = %self.upstream_host,
            request_id = %self.request_id,
        );

        if self.provider != "-" {
            metrics::record_request(
                &self.provider,
                self.status,
                &self.method,
                elapsed.as_secs_f64(),
                self.bytes,
            );
        }
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pin_project! {
    /// Upstream body relay: bounded chunks, byte counting, error-body capture.
    struct RelayStream<S> {
        #[pin]
        inner: S,
        pending: Bytes,
        log: Option<AccessLog>,
    }
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(RELAY_CHUNK_BYTES);
                let chunk = this.pending.split_to(n);
                if let Some(log) = this.log.as_mut() {
                    log.bytes += chunk.len() as u64;
                    if let Some(capture) = log.error_capture.as_mut() {
                        capture.push(&chunk);
                    }
                }
                return Poll::Ready(Some(Ok(chunk)));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => *this.pending = chunk,
                Poll::Ready(Some(Err(e))) => {
                    if let Some(log) = this.log.take() {
                        warn!(request_id = %log.request_id, provider = %log.provider, error = %e, "upstream body stream failed");
                        metrics::record_upstream_error(&log.provider, "stream");
                        log.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.log.take();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
