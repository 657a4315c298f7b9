//! Gateway route table and filter chains.
//!
//! # Global Filters (applied in order)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id forwarded upstream and echoed
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    X-Gateway     │ ← Response header with the gateway name
//! └────────┬─────────┘
//!          ▼
//!    Route filters → proxy
//! ```
//!
//! # Routes
//!
//! | Path | Filters | Upstream |
//! |---|---|---|
//! | `/api/**` | throttle, strip 1, `X-Proxy-By` | `UPSTREAM_URL` |
//! | `/gateway/rate/**` | keyed rate limit, strip 2 | `UPSTREAM_URL` |
//! | `/timing/**` | timing, strip 1 | `TIMING_UPSTREAM_URL` |
//! | `/anything/png` on `**.abc.org` | prefix `/httpbin`, response `X-TestHeader: foobar` | `HTTPBIN_URL` |
//! | `/image/webp` | prefix `/httpbin`, response `X-AnotherHeader: baz` | `HTTPBIN_URL` |
//! | `/get` on `**.throttle.org` | throttle (1 token per 10s), prefix `/httpbin` | `HTTPBIN_URL` |
//! | `/fallback` | | local |
//! | `/actuator`, `/actuator/health`, `/actuator/info` | | local |
//!
//! A `/**` route also answers its bare prefix, e.g. `/api` and `/api/`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::routing::{MethodRouter, any, get};
use tower::ServiceBuilder;
use tower_http::set_header::{SetRequestHeaderLayer, SetResponseHeaderLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

use crate::error::{AppError, AppResult};
use crate::filter::{
    HostLayer, REQUEST_ID_HEADER, RefillUnit, RequestIdLayer, RequestRateLimitLayer,
    ThrottleConfig, ThrottleLayer, TimingLayer, TrustedProxyConfig,
};
use crate::handlers;
use crate::proxy::{self, ProxyRoute};
use crate::state::AppState;

/// Response header naming the gateway on every response.
pub const GATEWAY_HEADER: &str = "x-gateway";

/// Request header naming the gateway on `/api/**` upstream requests.
pub const PROXY_BY_HEADER: &str = "x-proxy-by";

/// Path prefix prepended by the host-bound demo routes.
const HTTPBIN_PREFIX: &str = "/httpbin";

/// Build the gateway router with all routes and filters configured.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if a route's filters cannot be built from
/// the configuration (zero refill period, zero replenish rate, invalid
/// upstream URL or gateway name).
///
/// Starts the rate limiter's pruning task on the state's task tracker, so it
/// must be called from within a Tokio runtime.
pub fn build_router(state: AppState) -> AppResult<Router> {
    let config = state.config.clone();

    let gateway_name = HeaderValue::from_str(&config.gateway_name)
        .map_err(|e| AppError::ConfigError(format!("Invalid GATEWAY_NAME: {e}")))?;

    // =========================================================================
    // /api/** : throttle → strip prefix → X-Proxy-By
    // =========================================================================
    let throttle = config.throttle();
    let throttle_layer = ThrottleLayer::new("api", &throttle)
        .map_err(|e| AppError::ConfigError(format!("Invalid throttle for /api: {e}")))?;
    info!(
        capacity = throttle.capacity,
        refill_tokens = throttle.refill_tokens,
        refill_period = throttle.refill_period,
        refill_unit = %throttle.refill_unit,
        "Throttle configured for /api/**"
    );

    let api = proxy_to(ProxyRoute::new("api", &config.upstream_url, 1)?).layer(
        ServiceBuilder::new()
            .layer(throttle_layer)
            .layer(SetRequestHeaderLayer::overriding(
                HeaderName::from_static(PROXY_BY_HEADER),
                gateway_name.clone(),
            )),
    );

    // =========================================================================
    // /gateway/rate/** : keyed rate limit → strip prefix
    // =========================================================================
    let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));
    let rate_limit_layer = RequestRateLimitLayer::new(
        config.rate_limit_replenish_rate,
        config.rate_limit_burst_capacity,
        config.rate_limit_key_resolver,
        trusted_proxies,
    )
    .map_err(|e| AppError::ConfigError(format!("Invalid rate limit: {e}")))?;
    state.spawn_rate_limit_pruning(&rate_limit_layer);
    info!(
        replenish_rate = config.rate_limit_replenish_rate,
        burst_capacity = config.rate_limit_burst_capacity,
        resolver = %config.rate_limit_key_resolver,
        trusted_proxies = config.trusted_proxies.len(),
        "Keyed rate limiting configured for /gateway/rate/**"
    );

    let rate = proxy_to(ProxyRoute::new("rate", &config.upstream_url, 2)?).layer(rate_limit_layer);

    // =========================================================================
    // /timing/** : timing → strip prefix
    // =========================================================================
    let timing =
        proxy_to(ProxyRoute::new("timing", &config.timing_upstream_url, 1)?).layer(TimingLayer::new());

    // =========================================================================
    // Host and path predicates → prefix path /httpbin
    // =========================================================================
    let anything_png = proxy_to(
        ProxyRoute::new("anything_png", &config.httpbin_url, 0)?.with_prefix_path(HTTPBIN_PREFIX),
    )
    .layer(
        ServiceBuilder::new()
            .layer(HostLayer::new("**.abc.org"))
            .layer(SetResponseHeaderLayer::appending(
                HeaderName::from_static("x-testheader"),
                HeaderValue::from_static("foobar"),
            )),
    );

    let image_webp = proxy_to(
        ProxyRoute::new("image_webp", &config.httpbin_url, 0)?.with_prefix_path(HTTPBIN_PREFIX),
    )
    .layer(SetResponseHeaderLayer::appending(
        HeaderName::from_static("x-anotherheader"),
        HeaderValue::from_static("baz"),
    ));

    let throttle_org_config = ThrottleConfig::default()
        .with_capacity(1)
        .with_refill_tokens(1)
        .with_refill_period(10)
        .with_refill_unit(RefillUnit::Seconds);
    let throttle_org_layer = ThrottleLayer::new("throttle_org", &throttle_org_config)
        .map_err(|e| AppError::ConfigError(format!("Invalid throttle for /get: {e}")))?;
    let throttle_get = proxy_to(
        ProxyRoute::new("throttle_get", &config.httpbin_url, 0)?.with_prefix_path(HTTPBIN_PREFIX),
    )
    .layer(
        ServiceBuilder::new()
            .layer(HostLayer::new("**.throttle.org"))
            .layer(throttle_org_layer),
    );

    let router = Router::new();
    let router = route_prefix(router, "/api", api);
    let router = route_prefix(router, "/gateway/rate", rate);
    let router = route_prefix(router, "/timing", timing);

    let router = router
        .route("/anything/png", anything_png)
        .route("/image/webp", image_webp)
        .route("/get", throttle_get)
        .route("/fallback", any(handlers::fallback))
        .route("/actuator", get(handlers::actuator_index))
        .route("/actuator/health", get(handlers::health))
        .route("/actuator/info", get(handlers::info))
        // Applied bottom to top; the last layer sees the request first
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(GATEWAY_HEADER),
            gateway_name,
        ))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(RequestIdLayer::new());

    Ok(router.with_state(state))
}

/// Route `prefix`, `prefix/` and everything below it to `handler`.
fn route_prefix(
    router: Router<AppState>,
    prefix: &str,
    handler: MethodRouter<AppState>,
) -> Router<AppState> {
    router
        .route(prefix, handler.clone())
        .route(&format!("{prefix}/"), handler.clone())
        .route(&format!("{prefix}/{{*path}}"), handler)
}

/// Span of one HTTP request, carrying the id set by [`RequestIdLayer`].
fn request_span(req: &Request<Body>) -> Span {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    info_span!(
        "request",
        method = %req.method(),
        uri = %req.uri(),
        request_id = %request_id,
    )
}

/// Handler that forwards every method to the upstream of `route`.
fn proxy_to(route: ProxyRoute) -> MethodRouter<AppState> {
    let route = Arc::new(route);
    any(move |State(state): State<AppState>, req: Request<Body>| {
        let route = route.clone();
        async move { proxy::forward(&state, &route, req).await }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::test_support::CapturedLogs;

    fn router(config: Config) -> Router {
        build_router(AppState::new(config).unwrap()).unwrap()
    }

    async fn get_path(router: &Router, path: &str) -> axum::response::Response {
        router
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_actuator_endpoints() {
        let router = router(Config::default());

        let index = json_body(get_path(&router, "/actuator").await).await;
        assert_eq!(index["_links"]["self"]["href"], "/actuator");
        assert_eq!(index["_links"]["health"]["href"], "/actuator/health");

        let health = get_path(&router, "/actuator/health").await;
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(json_body(health).await["status"], "UP");

        let info = json_body(get_path(&router, "/actuator/info").await).await;
        assert_eq!(info["app"]["name"], "sample-gateway");
        assert_eq!(info["app"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_fallback_endpoint() {
        let response = get_path(&router(Config::default()), "/fallback").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], 503);
        assert!(body["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_global_headers_on_every_response() {
        let router = router(Config {
            gateway_name: "edge-1".to_string(),
            ..Config::default()
        });

        for path in ["/actuator/health", "/no/such/route"] {
            let response = get_path(&router, path).await;
            assert_eq!(response.headers()[GATEWAY_HEADER], "edge-1");
            assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        }
    }

    /// Config whose upstreams all point at a port nobody listens on.
    async fn unreachable_upstreams() -> Config {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        Config {
            upstream_url: closed.clone(),
            timing_upstream_url: closed.clone(),
            httpbin_url: closed,
            ..Config::default()
        }
    }

    async fn get_with_host(router: &Router, path: &str, host: &str) -> axum::response::Response {
        router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(path)
                    .header("host", host)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bare_prefixes_are_routed() {
        let router = router(unreachable_upstreams().await);

        for path in [
            "/api",
            "/api/",
            "/gateway/rate",
            "/gateway/rate/",
            "/timing",
            "/timing/",
        ] {
            let response = get_path(&router, path).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{path}");
        }
    }

    #[tokio::test]
    async fn test_host_bound_route_requires_matching_host() {
        let router = router(unreachable_upstreams().await);

        let response = get_with_host(&router, "/anything/png", "localhost").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = get_with_host(&router, "/anything/png", "img.abc.org").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-testheader"], "foobar");
    }

    #[tokio::test]
    async fn test_image_route_adds_response_header() {
        let router = router(unreachable_upstreams().await);

        let response = get_path(&router, "/image/webp").await;
        assert_eq!(response.headers()["x-anotherheader"], "baz");
    }

    #[tokio::test]
    async fn test_throttle_org_route_has_its_own_bucket() {
        let router = router(unreachable_upstreams().await);

        // The single token lets the first request through to the upstream
        let first = get_with_host(&router, "/get", "www.throttle.org").await;
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);

        let second = get_with_host(&router, "/get", "www.throttle.org").await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        // The /api bucket is untouched
        let api = get_path(&router, "/api/test").await;
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_request_span_carries_request_id() {
        let logs = CapturedLogs::default();
        let _subscriber = tracing::subscriber::set_default(logs.subscriber());
        let router = router(Config::default());

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/actuator/health")
                    .header(REQUEST_ID_HEADER, "trace-me-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let output = logs.contents();
        assert!(output.contains("request_id=trace-me-123"), "{output}");
    }

    #[tokio::test]
    async fn test_invalid_filters_rejected() {
        let state = AppState::new(Config {
            throttle_refill_period: 0,
            ..Config::default()
        })
        .unwrap();
        assert!(matches!(build_router(state), Err(AppError::ConfigError(_))));

        let state = AppState::new(Config {
            rate_limit_replenish_rate: 0,
            ..Config::default()
        })
        .unwrap();
        assert!(matches!(build_router(state), Err(AppError::ConfigError(_))));
    }
}
