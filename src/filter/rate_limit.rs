//! Keyed request rate limiting.
//!
//! # Algorithm
//!
//! Uses governor's keyed GCRA limiter: every key owns a bucket of
//! `burst_capacity` permits replenished at `replenish_rate` permits per second.
//! Keys are derived from the request by a [`KeyResolver`]:
//!
//! | Resolver | Key |
//! |---|---|
//! | `ip` | client IP, see [`super::ip`] |
//! | `path` | request path |
//! | `smart` | `"{ip}:{segment}"`, where `segment` follows `/gateway/rate/` |
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the next request will be accepted
//! - `X-RateLimit-Limit`: Configured replenish rate
//! - `X-RateLimit-Remaining`: Always `0`
//!
//! # Memory
//!
//! Each key holds a small state entry. Entries whose bucket has refilled are
//! indistinguishable from new keys and are dropped by [`RequestRateLimitLayer::prune`],
//! which [`RequestRateLimitLayer::run_pruning`] calls periodically.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::ip::{TrustedProxyConfig, resolve_client_ip};
use crate::metrics;

/// Path prefix whose next segment partitions the `smart` key space.
pub const RATE_PATH_PREFIX: &str = "/gateway/rate/";

/// Segment used by the `smart` resolver outside [`RATE_PATH_PREFIX`].
pub const DEFAULT_SEGMENT: &str = "default";

/// Error type for rate limit layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Replenish rate cannot be zero.
    ZeroRate,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroRate => write!(f, "replenish rate must be greater than 0"),
        }
    }
}

impl std::error::Error for RateLimitError {}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Strategy for deriving the rate limit key of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyResolver {
    /// One bucket per client IP
    Ip,
    /// One bucket per request path
    Path,
    /// One bucket per client IP and API segment
    #[default]
    Smart,
}

impl KeyResolver {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyResolver::Ip => "ip",
            KeyResolver::Path => "path",
            KeyResolver::Smart => "smart",
        }
    }

    /// Compute the bucket key for `req`.
    pub fn resolve<B>(&self, req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> String {
        match self {
            KeyResolver::Ip => resolve_client_ip(req, trusted_proxies).into_owned(),
            KeyResolver::Path => req.uri().path().to_string(),
            KeyResolver::Smart => {
                let ip = resolve_client_ip(req, trusted_proxies);
                format!("{ip}:{}", api_segment(req.uri().path()))
            }
        }
    }
}

impl fmt::Display for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown `RATE_LIMIT_KEY_RESOLVER` value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown key resolver '{0}', expected one of: ip, path, smart")]
pub struct ParseKeyResolverError(String);

impl FromStr for KeyResolver {
    type Err = ParseKeyResolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(KeyResolver::Ip),
            "path" => Ok(KeyResolver::Path),
            "smart" => Ok(KeyResolver::Smart),
            _ => Err(ParseKeyResolverError(s.to_string())),
        }
    }
}

/// Path segment directly after [`RATE_PATH_PREFIX`], or [`DEFAULT_SEGMENT`].
pub fn api_segment(path: &str) -> &str {
    path.strip_prefix(RATE_PATH_PREFIX)
        .and_then(|rest| rest.split('/').next())
        .filter(|segment| !segment.is_empty())
        .unwrap_or(DEFAULT_SEGMENT)
}

/// Keyed rate limiting layer.
///
/// # Example
///
/// ```rust,ignore
/// let layer = RequestRateLimitLayer::new(10, 20, KeyResolver::Smart, trusted)?;
/// let app = Router::new()
///     .route("/gateway/rate/{*path}", any(handler))
///     .route_layer(layer);
/// ```
#[derive(Clone)]
pub struct RequestRateLimitLayer {
    limiter: Arc<KeyedLimiter>,
    /// Configured replenish rate (for headers)
    limit: u32,
    resolver: KeyResolver,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RequestRateLimitLayer {
    /// Create a keyed rate limit layer.
    ///
    /// A `burst_capacity` of zero is raised to one.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::ZeroRate` if `replenish_rate` is 0.
    pub fn new(
        replenish_rate: u32,
        burst_capacity: u32,
        resolver: KeyResolver,
        trusted_proxies: Arc<TrustedProxyConfig>,
    ) -> Result<Self, RateLimitError> {
        let rate = NonZeroU32::new(replenish_rate).ok_or(RateLimitError::ZeroRate)?;
        let burst = NonZeroU32::new(burst_capacity).unwrap_or(NonZeroU32::MIN);

        let quota = Quota::per_second(rate).allow_burst(burst);
        debug!(
            replenish_rate,
            burst_capacity = burst.get(),
            resolver = %resolver,
            "Keyed rate limiter configured"
        );

        Ok(Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            limit: replenish_rate,
            resolver,
            trusted_proxies,
        })
    }

    pub fn resolver(&self) -> KeyResolver {
        self.resolver
    }

    /// Number of keys currently holding limiter state.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }

    /// Forget keys whose bucket is full again and release the freed memory.
    ///
    /// Returns the number of keys still tracked.
    pub fn prune(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    /// Call [`prune`](Self::prune) every `every` until `cancel` fires.
    pub async fn run_pruning(self, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Rate limit pruning task received cancellation signal");
                    break;
                }
                _ = ticker.tick() => {
                    let remaining = self.prune();
                    trace!(remaining, "Pruned idle rate limit keys");
                }
            }
        }
    }
}

impl<S> Layer<S> for RequestRateLimitLayer {
    type Service = RequestRateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestRateLimitService {
            inner,
            limiter: self.limiter.clone(),
            limit: self.limit,
            resolver: self.resolver,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

/// Keyed rate limiting service wrapper.
#[derive(Clone)]
pub struct RequestRateLimitService<S> {
    inner: S,
    limiter: Arc<KeyedLimiter>,
    limit: u32,
    resolver: KeyResolver,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for RequestRateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let key = self.resolver.resolve(&req, &self.trusted_proxies);

        match self.limiter.check_key(&key) {
            Ok(()) => {
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after = wait_time.as_secs().max(1);

                warn!(
                    key = %key,
                    resolver = %self.resolver,
                    path = %req.uri().path(),
                    retry_after_secs = retry_after,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited(self.resolver.as_str());

                let response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    [
                        ("Retry-After", retry_after.to_string()),
                        ("X-RateLimit-Limit", self.limit.to_string()),
                        ("X-RateLimit-Remaining", "0".to_string()),
                    ],
                    "Rate limit exceeded. Please retry later.",
                )
                    .into_response();

                Box::pin(async move { Ok::<_, S::Error>(response) })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use axum::extract::ConnectInfo;
    use tower::{ServiceExt, service_fn};

    use super::*;

    fn request(path: &str, peer: &str) -> Request<Body> {
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn layer(rate: u32, burst: u32, resolver: KeyResolver) -> RequestRateLimitLayer {
        RequestRateLimitLayer::new(rate, burst, resolver, Arc::new(TrustedProxyConfig::default()))
            .unwrap()
    }

    async fn status_of(layer: &RequestRateLimitLayer, req: Request<Body>) -> StatusCode {
        let stage = service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        layer.layer(stage).oneshot(req).await.unwrap().status()
    }

    #[test]
    fn test_zero_rate_returns_error() {
        let result = RequestRateLimitLayer::new(
            0,
            20,
            KeyResolver::Ip,
            Arc::new(TrustedProxyConfig::default()),
        );
        assert!(matches!(result, Err(RateLimitError::ZeroRate)));
    }

    #[test]
    fn test_key_resolver_parse() {
        assert_eq!("ip".parse::<KeyResolver>().unwrap(), KeyResolver::Ip);
        assert_eq!(" PATH ".parse::<KeyResolver>().unwrap(), KeyResolver::Path);
        assert_eq!("smart".parse::<KeyResolver>().unwrap(), KeyResolver::Smart);
        assert!("user".parse::<KeyResolver>().is_err());
        assert_eq!(KeyResolver::Smart.to_string(), "smart");
    }

    #[test]
    fn test_api_segment() {
        assert_eq!(api_segment("/gateway/rate/api/users"), "api");
        assert_eq!(api_segment("/gateway/rate/orders"), "orders");
        assert_eq!(api_segment("/gateway/rate/"), DEFAULT_SEGMENT);
        assert_eq!(api_segment("/api/users"), DEFAULT_SEGMENT);
    }

    #[test]
    fn test_resolver_keys() {
        let trusted = TrustedProxyConfig::default();
        let req = request("/gateway/rate/api/users", "192.0.2.10:4000");

        assert_eq!(KeyResolver::Ip.resolve(&req, &trusted), "192.0.2.10");
        assert_eq!(
            KeyResolver::Path.resolve(&req, &trusted),
            "/gateway/rate/api/users"
        );
        assert_eq!(KeyResolver::Smart.resolve(&req, &trusted), "192.0.2.10:api");
    }

    #[test]
    fn test_smart_key_without_client_ip() {
        let req = Request::builder()
            .uri("/elsewhere")
            .body(Body::empty())
            .unwrap();
        let key = KeyResolver::Smart.resolve(&req, &TrustedProxyConfig::default());
        assert_eq!(key, "0.0.0.0:default");
    }

    #[tokio::test]
    async fn test_burst_then_rejection_headers() {
        let layer = layer(1, 2, KeyResolver::Ip);

        for _ in 0..2 {
            let status = status_of(&layer, request("/gateway/rate/a", "192.0.2.1:1")).await;
            assert_eq!(status, StatusCode::OK);
        }

        let stage = service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        let response = layer
            .layer(stage)
            .oneshot(request("/gateway/rate/a", "192.0.2.1:1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "1");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
        let retry_after: u64 = response.headers()["Retry-After"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);
    }

    #[tokio::test]
    async fn test_smart_keys_are_independent_per_segment() {
        let layer = layer(1, 1, KeyResolver::Smart);

        assert_eq!(
            status_of(&layer, request("/gateway/rate/api/x", "192.0.2.1:1")).await,
            StatusCode::OK
        );
        assert_eq!(
            status_of(&layer, request("/gateway/rate/api/y", "192.0.2.1:1")).await,
            StatusCode::TOO_MANY_REQUESTS
        );
        // Different segment, same client
        assert_eq!(
            status_of(&layer, request("/gateway/rate/orders/1", "192.0.2.1:1")).await,
            StatusCode::OK
        );
        // Same segment, different client
        assert_eq!(
            status_of(&layer, request("/gateway/rate/api/x", "192.0.2.2:1")).await,
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_malformed_forwarded_for_shares_peer_bucket() {
        let layer = layer(1, 1, KeyResolver::Ip);

        for i in 0..1_000 {
            let mut req = request("/gateway/rate/a", "192.0.2.1:1");
            req.headers_mut()
                .insert("x-forwarded-for", format!("not-an-ip-{i}").parse().unwrap());
            let _ = status_of(&layer, req).await;
        }

        assert_eq!(layer.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_prune_forgets_refilled_keys() {
        let layer = layer(1_000, 1, KeyResolver::Ip);

        for peer in ["192.0.2.1:1", "192.0.2.2:1", "192.0.2.3:1"] {
            assert_eq!(
                status_of(&layer, request("/gateway/rate/a", peer)).await,
                StatusCode::OK
            );
        }
        assert_eq!(layer.tracked_keys(), 3);

        // One permit per millisecond, so every bucket is full again
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(layer.prune(), 0);
    }

    #[tokio::test]
    async fn test_pruning_task_stops_on_cancel() {
        let layer = layer(1_000, 1, KeyResolver::Ip);
        let _ = status_of(&layer, request("/gateway/rate/a", "192.0.2.1:1")).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(layer.clone().run_pruning(Duration::from_millis(5), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(layer.tracked_keys(), 0);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_request_skips_next_stage() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stage = service_fn(move |_req: Request<Body>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        });
        let service = layer(1, 1, KeyResolver::Path).layer(stage);

        for _ in 0..3 {
            let _ = service
                .clone()
                .oneshot(request("/gateway/rate/p", "192.0.2.1:1"))
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
