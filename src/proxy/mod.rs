//! Cache-aside request handling.
//!
//! Each request is classified (only GET participates in caching), keyed,
//! and looked up; a miss falls through to a single upstream dispatch whose
//! 200 responses are stored for the configured TTL. Concurrent misses for
//! the same key each reach the upstream independently and both write the
//! cache — last write wins, no coordination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::key::cache_key;
use crate::cache::TtlCache;
use crate::metrics::ProxyMetrics;

/// Upper bound on a single upstream round trip, enforced independently of
/// the caller's connection lifetime.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Response header reporting whether a request was served from cache.
const CACHE_STATUS_HEADER: &str = "x-cache";

/// Serialized form of a cached upstream response. Used only as the cache's
/// internal value representation.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredResponse {
    pub headers: HashMap<String, Vec<String>>,
    pub status_code: u16,
    pub body: Vec<u8>,
}

/// Failure modes of a single upstream dispatch.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    #[error("upstream request timed out")]
    Timeout,
    #[error("failed to read upstream response body: {0}")]
    ReadBody(hyper::Error),
}

impl UpstreamError {
    /// Status relayed to the caller for this failure.
    fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Connect(_) | UpstreamError::Timeout => StatusCode::BAD_GATEWAY,
            UpstreamError::ReadBody(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Cache-aside reverse proxy handler for one upstream service.
pub struct CacheProxy {
    upstream: Uri,
    client: Client<HttpConnector, Full<Bytes>>,
    cache: Arc<TtlCache>,
    metrics: Arc<ProxyMetrics>,
}

impl CacheProxy {
    /// Creates a handler forwarding to `upstream` (an absolute URI). The
    /// client is shared across all requests and owns its connection pool.
    pub fn new(upstream: Uri, cache: Arc<TtlCache>, metrics: Arc<ProxyMetrics>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            upstream,
            client,
            cache,
            metrics,
        }
    }

    /// Processes one inbound request: cache lookup for GET, upstream
    /// fallback on a miss or for any other method.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let cacheable = req.method() == Method::GET;
        let key = cache_key(
            req.method(),
            req.uri().path(),
            req.uri().query(),
            self.cache.ttl(),
        );

        debug!(
            method = %req.method(),
            path = req.uri().path(),
            query = req.uri().query().unwrap_or(""),
            key = %key,
            cacheable,
            "request received"
        );

        if cacheable {
            if let Some(resp) = self.serve_cached(&key, req.uri().path()) {
                return resp;
            }
        }

        info!(path = req.uri().path(), key = %key, "cache miss, forwarding to upstream");
        self.forward(req, &key, cacheable).await
    }

    /// Attempts to serve `key` from cache. Returns `None` on a miss, and
    /// also when the stored entry cannot be decoded — the entry is left in
    /// place for the sweeper.
    fn serve_cached(&self, key: &str, path: &str) -> Option<Response<Full<Bytes>>> {
        let raw = self.cache.get(key)?;

        let stored: StoredResponse = match serde_json::from_slice(&raw) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(key, error = %err, "failed to decode cached response, treating as miss");
                return None;
            }
        };
        let status = match StatusCode::from_u16(stored.status_code) {
            Ok(status) => status,
            Err(err) => {
                warn!(key, error = %err, "cached response has invalid status, treating as miss");
                return None;
            }
        };

        info!(path, key, "serving from cache");
        self.metrics.cache_hits_total.inc();

        let mut resp = Response::new(Full::new(Bytes::from(stored.body)));
        *resp.status_mut() = status;
        let headers = resp.headers_mut();
        for (name, values) in &stored.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static("HIT"),
        );
        Some(resp)
    }

    /// Forwards the request upstream and relays the response, storing it
    /// when the request was cacheable and the upstream answered 200.
    async fn forward<B>(&self, req: Request<B>, key: &str, cacheable: bool) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        // The inbound body backs the upstream call, so it must be fully
        // buffered before dispatch.
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!(path = parts.uri.path(), error = %err, "failed to read request body");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let upstream_req = match self.build_upstream_request(&parts, body) {
            Ok(req) => req,
            Err(err) => {
                error!(path = parts.uri.path(), error = %err, "failed to build upstream request");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let (head, body) = match self.fetch_upstream(upstream_req).await {
            Ok(resp) => resp,
            Err(err) => {
                error!(path = parts.uri.path(), key, error = %err, "upstream request failed");
                return status_response(err.status());
            }
        };

        debug!(
            status = head.status.as_u16(),
            size = body.len(),
            path = parts.uri.path(),
            "received upstream response"
        );

        if cacheable && head.status == StatusCode::OK {
            self.store_response(key, &head, &body);
        }

        // Relay the upstream response verbatim; only the stored copy is
        // filtered.
        self.metrics.cache_misses_total.inc();
        let mut resp = Response::new(Full::new(body));
        *resp.status_mut() = head.status;
        *resp.headers_mut() = head.headers;
        resp.headers_mut().insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static("MISS"),
        );
        resp
    }

    /// Rebuilds the inbound request against the upstream base URL, keeping
    /// method, path, raw query string, headers, and the buffered body.
    fn build_upstream_request(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, http::Error> {
        let path_and_query = match parts.uri.query() {
            Some(query) => format!("{}?{}", parts.uri.path(), query),
            None => parts.uri.path().to_string(),
        };

        let mut uri_parts = self.upstream.clone().into_parts();
        uri_parts.path_and_query = Some(path_and_query.parse()?);
        let uri = Uri::from_parts(uri_parts)?;

        let mut req = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(Full::new(body))?;
        *req.headers_mut() = parts.headers.clone();
        Ok(req)
    }

    /// Issues the upstream call exactly once, bounded by
    /// [`UPSTREAM_TIMEOUT`], and buffers the response body. The latency
    /// observation covers the dispatch itself, whatever the outcome.
    async fn fetch_upstream(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<(http::response::Parts, Bytes), UpstreamError> {
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req)).await;
        self.metrics
            .upstream_duration
            .observe(start.elapsed().as_secs_f64());

        let resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => return Err(UpstreamError::Connect(err)),
            Err(_) => return Err(UpstreamError::Timeout),
        };

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(UpstreamError::ReadBody)?
            .to_bytes();
        Ok((parts, body))
    }

    /// Serializes a cacheable upstream response, minus the denylisted
    /// headers, and stores it under `key`.
    fn store_response(&self, key: &str, head: &http::response::Parts, body: &Bytes) {
        let stored = StoredResponse {
            headers: sanitize_stored_headers(&head.headers),
            status_code: head.status.as_u16(),
            body: body.to_vec(),
        };

        let encoded = match serde_json::to_vec(&stored) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(key, error = %err, "failed to encode response for caching");
                return;
            }
        };

        debug!(
            key,
            status = stored.status_code,
            size = body.len(),
            "caching response"
        );
        self.cache.insert(key.to_string(), Bytes::from(encoded));
        self.metrics.cache_size.set(self.cache.len() as i64);
    }
}

/// Minimal response carrying only a status code.
pub(crate) fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

/// Header names excluded from the stored copy of a response. `HeaderName`
/// is lowercase by construction, so this match is case-insensitive.
fn skip_cached_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "date" | "connection" | "transfer-encoding" | "keep-alive"
    )
}

/// Copies `headers` into the stored representation, dropping names that
/// must not be replayed from cache. Non-UTF-8 values cannot be represented
/// in the stored form and are skipped; the relayed response still carries
/// them.
fn sanitize_stored_headers(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if skip_cached_header(name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylisted_headers_are_skipped_case_insensitively() {
        for name in ["Date", "Connection", "Transfer-Encoding", "Keep-Alive"] {
            let name = HeaderName::try_from(name).unwrap();
            assert!(skip_cached_header(&name), "{name:?} should be skipped");
        }
        let kept = HeaderName::from_static("content-type");
        assert!(!skip_cached_header(&kept));
    }

    #[test]
    fn sanitize_drops_denylist_and_preserves_value_order() {
        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_static("today"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.append("x-warning", HeaderValue::from_static("first"));
        headers.append("x-warning", HeaderValue::from_static("second"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let stored = sanitize_stored_headers(&headers);
        assert_eq!(stored.len(), 2);
        assert_eq!(
            stored["x-warning"],
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(stored["content-type"], vec!["application/json".to_string()]);
    }

    #[test]
    fn timeout_maps_to_bad_gateway() {
        assert_eq!(UpstreamError::Timeout.status(), StatusCode::BAD_GATEWAY);
    }
}
