//! Listener, per-connection serving, and request routing.
//!
//! One listener carries both surfaces: paths under the configured route
//! prefix are proxied upstream through the cache, while `/health`,
//! `/metrics`, and `/debug/cache` are answered locally.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::metrics::ProxyMetrics;
use crate::proxy::{status_response, CacheProxy};

/// Shared state routed into every connection task.
pub struct AppState {
    pub proxy: CacheProxy,
    pub cache: Arc<TtlCache>,
    pub metrics: Arc<ProxyMetrics>,
    pub route_prefix: String,
}

/// Accepts connections until `shutdown` is cancelled, then waits up to
/// `grace` for in-flight connections to finish.
pub async fn run(
    listen_addr: &str,
    state: Arc<AppState>,
    shutdown: CancellationToken,
    grace: Duration,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!("listening on {}", listen_addr);

    let tracker = TaskTracker::new();

    loop {
        // Accept new connections, or break on shutdown signal
        let (stream, peer) = tokio::select! {
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(err) => {
                    error!("accept error: {}", err);
                    continue;
                }
            },
            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer accepting connections");
                break;
            }
        };

        let state = Arc::clone(&state);
        tracker.spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route(req, state).await) }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                debug!("error serving connection from {}: {:?}", peer, err);
            }
        });
    }

    tracker.close();
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        warn!("shutdown grace period elapsed with connections still open");
    }
    Ok(())
}

/// Dispatches a request to the proxy or one of the local endpoints.
async fn route<B>(req: Request<B>, state: Arc<AppState>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    if req.uri().path().starts_with(&state.route_prefix) {
        return state.proxy.handle(req).await;
    }

    match req.uri().path() {
        "/health" => text_response(StatusCode::OK, "OK"),
        "/metrics" => metrics_response(&state.metrics),
        "/debug/cache" if req.method() == Method::GET => debug_cache_response(&state.cache),
        _ => status_response(StatusCode::NOT_FOUND),
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}

fn metrics_response(metrics: &ProxyMetrics) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(metrics.encode())));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    resp
}

/// Reports the cache keys currently present. The count includes entries
/// that have expired but have not been swept yet, so it can overstate the
/// live population.
fn debug_cache_response(cache: &TtlCache) -> Response<Full<Bytes>> {
    let keys = cache.keys();
    let payload = serde_json::json!({
        "num_keys": keys.len(),
        "keys": keys,
    });
    let mut resp = Response::new(Full::new(Bytes::from(payload.to_string())));
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    fn test_state() -> Arc<AppState> {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(300)));
        let metrics = Arc::new(ProxyMetrics::new());
        let proxy = CacheProxy::new(
            "http://127.0.0.1:9".parse().unwrap(),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        );
        Arc::new(AppState {
            proxy,
            cache,
            metrics,
            route_prefix: "/api/".to_string(),
        })
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let resp = route(get("/health"), test_state()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "OK");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let resp = route(get("/nope"), test_state()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition_format() {
        let state = test_state();
        state.metrics.cache_hits_total.inc();

        let resp = route(get("/metrics"), state).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_string(resp)
            .await
            .contains("chronocache_cache_hits_total 1"));
    }

    #[tokio::test]
    async fn debug_cache_lists_unswept_keys() {
        let state = test_state();
        state
            .cache
            .insert("GET:/api/v1/query:query=up".to_string(), Bytes::new());

        let resp = route(get("/debug/cache"), Arc::clone(&state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let payload: serde_json::Value =
            serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(payload["num_keys"], 1);
        assert_eq!(payload["keys"][0], "GET:/api/v1/query:query=up");
    }

    #[tokio::test]
    async fn debug_cache_rejects_other_methods() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/debug/cache")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = route(req, test_state()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
