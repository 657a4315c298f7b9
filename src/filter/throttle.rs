//! Throttle filter: per-route admission control backed by one token bucket.
//!
//! # Algorithm
//!
//! Every request tries to take one token from the route's bucket:
//!
//! - Token taken: the request continues down the filter chain and the inner
//!   service's result is returned unchanged.
//! - Bucket empty: the chain is cut short with `429 Too Many Requests` and an
//!   empty body. The inner service is never called.
//!
//! # Refill
//!
//! Refill happens at fixed intervals: each time a full `refill_period` has
//! elapsed, `refill_tokens` are added at once, and the total is capped at
//! `capacity`. Nothing trickles in between two period boundaries, so a bucket
//! never admits more than `capacity + refill_tokens` requests in any window
//! of one period, however large `refill_tokens` is.
//!
//! Buckets that can never refill (capacity 0 or refill amount 0) are a plain
//! atomic counter.
//!
//! # Sharing
//!
//! The bucket is built once, in [`ThrottleLayer::new`], and shared through an
//! `Arc` by every clone of the layer and every service it produces. All
//! requests routed through one filter instance draw from the same bucket.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ThrottleConfig::default()
//!     .with_capacity(10)
//!     .with_refill_tokens(1)
//!     .with_refill_period(1)
//!     .with_refill_unit(RefillUnit::Seconds);
//!
//! let app = Router::new()
//!     .route("/api/{*path}", any(handler))
//!     .route_layer(ThrottleLayer::new("api", &config)?);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;
use tower::{Layer, Service};
use tracing::debug;

use crate::metrics;

/// Error type for throttle layer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    /// Tokens are refilled but the refill period is zero.
    ZeroRefillPeriod,
}

impl fmt::Display for ThrottleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleError::ZeroRefillPeriod => write!(
                f,
                "refill period must be greater than 0 when refill tokens are configured"
            ),
        }
    }
}

impl std::error::Error for ThrottleError {}

/// Time unit of the refill period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefillUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl RefillUnit {
    /// Convert `value` units into a duration, saturating on overflow.
    pub fn to_duration(self, value: u64) -> Duration {
        match self {
            RefillUnit::Nanoseconds => Duration::from_nanos(value),
            RefillUnit::Microseconds => Duration::from_micros(value),
            RefillUnit::Milliseconds => Duration::from_millis(value),
            RefillUnit::Seconds => Duration::from_secs(value),
            RefillUnit::Minutes => Duration::from_secs(value.saturating_mul(60)),
            RefillUnit::Hours => Duration::from_secs(value.saturating_mul(3_600)),
            RefillUnit::Days => Duration::from_secs(value.saturating_mul(86_400)),
        }
    }
}

impl fmt::Display for RefillUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefillUnit::Nanoseconds => "nanoseconds",
            RefillUnit::Microseconds => "microseconds",
            RefillUnit::Milliseconds => "milliseconds",
            RefillUnit::Seconds => "seconds",
            RefillUnit::Minutes => "minutes",
            RefillUnit::Hours => "hours",
            RefillUnit::Days => "days",
        };
        f.write_str(name)
    }
}

/// Error returned when a refill unit name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown refill unit `{0}` (expected nanoseconds, microseconds, milliseconds, seconds, minutes, hours or days)")]
pub struct ParseRefillUnitError(String);

impl FromStr for RefillUnit {
    type Err = ParseRefillUnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ns" | "nanoseconds" => Ok(RefillUnit::Nanoseconds),
            "us" | "microseconds" => Ok(RefillUnit::Microseconds),
            "ms" | "milliseconds" => Ok(RefillUnit::Milliseconds),
            "s" | "seconds" => Ok(RefillUnit::Seconds),
            "m" | "minutes" => Ok(RefillUnit::Minutes),
            "h" | "hours" => Ok(RefillUnit::Hours),
            "d" | "days" => Ok(RefillUnit::Days),
            other => Err(ParseRefillUnitError(other.to_string())),
        }
    }
}

/// Bucket parameters of a throttle filter.
///
/// Set once when the route is defined; the layer copies what it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Maximum number of tokens held by the bucket
    pub capacity: u32,
    /// Tokens added per refill period
    pub refill_tokens: u32,
    /// Refill period, in `refill_unit`
    pub refill_period: u64,
    /// Unit of `refill_period`
    pub refill_unit: RefillUnit,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_tokens: 1,
            refill_period: 10,
            refill_unit: RefillUnit::Seconds,
        }
    }
}

impl ThrottleConfig {
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_tokens(mut self, refill_tokens: u32) -> Self {
        self.refill_tokens = refill_tokens;
        self
    }

    pub fn with_refill_period(mut self, refill_period: u64) -> Self {
        self.refill_period = refill_period;
        self
    }

    pub fn with_refill_unit(mut self, refill_unit: RefillUnit) -> Self {
        self.refill_unit = refill_unit;
        self
    }

    /// Length of one refill period.
    pub fn refill_interval(&self) -> Duration {
        self.refill_unit.to_duration(self.refill_period)
    }
}

/// How a bucket regains tokens.
enum Refill {
    /// Adds `refill_tokens` at every elapsed period boundary.
    FixedInterval(FixedInterval),
    /// Fixed pool of remaining tokens that is never replenished.
    Never(AtomicU32),
}

/// Fixed-interval refill state, guarded by a mutex.
///
/// The critical section is a few integer operations, so the lock is never
/// held across an await point or for any measurable time.
struct FixedInterval {
    refill_tokens: u32,
    interval: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: u32,
    /// Start of the current refill period
    last_refill: Instant,
}

impl FixedInterval {
    /// Take one token as of `now`, first crediting every whole period that
    /// has elapsed since the last refill.
    fn try_consume_at(&self, capacity: u32, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed >= self.interval {
            let periods = elapsed.as_nanos() / self.interval.as_nanos();
            let added = periods.saturating_mul(u128::from(self.refill_tokens));
            let refilled = (u128::from(state.tokens) + added).min(u128::from(capacity));
            state.tokens = u32::try_from(refilled).unwrap_or(capacity);

            // Keep period boundaries aligned to the creation instant
            let advanced = periods.saturating_mul(self.interval.as_nanos());
            state.last_refill = match u64::try_from(advanced) {
                Ok(nanos) => state.last_refill + Duration::from_nanos(nanos),
                Err(_) => now,
            };
        }

        match state.tokens.checked_sub(1) {
            Some(remaining) => {
                state.tokens = remaining;
                true
            }
            None => false,
        }
    }
}

/// Token bucket shared by all requests passing through one throttle filter.
pub struct TokenBucket {
    capacity: u32,
    refill: Refill,
}

impl TokenBucket {
    /// Build a bucket that starts full.
    ///
    /// # Errors
    ///
    /// Returns `ThrottleError::ZeroRefillPeriod` if tokens are refilled
    /// (`refill_tokens > 0`) over a zero-length period.
    pub fn new(config: &ThrottleConfig) -> Result<Self, ThrottleError> {
        let refill = match (config.capacity, config.refill_tokens) {
            (0, _) => Refill::Never(AtomicU32::new(0)),
            (capacity, 0) => Refill::Never(AtomicU32::new(capacity)),
            (capacity, refill_tokens) => {
                let interval = config.refill_interval();
                if interval.is_zero() {
                    return Err(ThrottleError::ZeroRefillPeriod);
                }
                Refill::FixedInterval(FixedInterval {
                    refill_tokens,
                    interval,
                    state: Mutex::new(BucketState {
                        tokens: capacity,
                        last_refill: Instant::now(),
                    }),
                })
            }
        };

        Ok(Self {
            capacity: config.capacity,
            refill,
        })
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whether consumed tokens are ever replenished.
    pub fn refills(&self) -> bool {
        matches!(self.refill, Refill::FixedInterval(_))
    }

    /// Atomically take one token. Returns `false` if none is available.
    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&self, now: Instant) -> bool {
        match &self.refill {
            Refill::FixedInterval(bucket) => bucket.try_consume_at(self.capacity, now),
            Refill::Never(remaining) => remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                    tokens.checked_sub(1)
                })
                .is_ok(),
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refills", &self.refills())
            .finish()
    }
}

/// Throttle layer for a route's filter chain.
#[derive(Clone, Debug)]
pub struct ThrottleLayer {
    bucket: Arc<TokenBucket>,
    /// Route name (for logs and metrics)
    route: &'static str,
}

impl ThrottleLayer {
    /// Create a throttle layer and its bucket.
    ///
    /// # Errors
    ///
    /// Returns `ThrottleError::ZeroRefillPeriod` if the refill period is zero
    /// while tokens are refilled.
    pub fn new(route: &'static str, config: &ThrottleConfig) -> Result<Self, ThrottleError> {
        let bucket = TokenBucket::new(config)?;
        debug!(
            route,
            capacity = config.capacity,
            refill_tokens = config.refill_tokens,
            refill_interval = ?config.refill_interval(),
            "Throttle bucket created"
        );

        Ok(Self {
            bucket: Arc::new(bucket),
            route,
        })
    }

    /// The bucket shared by every service built from this layer.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            bucket: self.bucket.clone(),
            route: self.route,
        }
    }
}

/// Throttle service wrapper.
#[derive(Clone)]
pub struct ThrottleService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
    route: &'static str,
}

impl<S> Service<Request<Body>> for ThrottleService<S>
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
        if self.bucket.try_consume() {
            debug!(route = self.route, "Request allowed - token consumed");
            // Call the instance that was driven to readiness
            let clone = self.inner.clone();
            let mut inner = std::mem::replace(&mut self.inner, clone);
            return Box::pin(async move { inner.call(req).await });
        }

        debug!(
            route = self.route,
            capacity = self.bucket.capacity(),
            path = %req.uri().path(),
            "Request throttled - no tokens available"
        );
        metrics::record_throttled(self.route);

        Box::pin(async move {
            Ok::<_, S::Error>(StatusCode::TOO_MANY_REQUESTS.into_response())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    use axum::body::to_bytes;
    use tower::util::BoxCloneService;
    use tower::{ServiceExt, service_fn};

    use super::*;

    fn request() -> Request<Body> {
        Request::builder()
            .uri("/api/test")
            .body(Body::empty())
            .unwrap()
    }

    /// A next stage that counts how often it is invoked.
    fn counting_stage(
        calls: Arc<AtomicUsize>,
    ) -> BoxCloneService<Request<Body>, Response<Body>, Infallible> {
        BoxCloneService::new(service_fn(move |_req: Request<Body>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(Response::new(Body::from("downstream")))
            }
        }))
    }

    fn config(capacity: u32, refill_tokens: u32, period: u64, unit: RefillUnit) -> ThrottleConfig {
        ThrottleConfig::default()
            .with_capacity(capacity)
            .with_refill_tokens(refill_tokens)
            .with_refill_period(period)
            .with_refill_unit(unit)
    }

    #[test]
    fn test_config_builder_chains() {
        let config = config(10, 2, 5, RefillUnit::Seconds);

        assert_eq!(config.capacity, 10);
        assert_eq!(config.refill_tokens, 2);
        assert_eq!(config.refill_period, 5);
        assert_eq!(config.refill_unit, RefillUnit::Seconds);
        assert_eq!(config.refill_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_refill_unit_parse() {
        assert_eq!("SECONDS".parse::<RefillUnit>().unwrap(), RefillUnit::Seconds);
        assert_eq!("ms".parse::<RefillUnit>().unwrap(), RefillUnit::Milliseconds);
        assert_eq!(" minutes ".parse::<RefillUnit>().unwrap(), RefillUnit::Minutes);
        assert!("fortnights".parse::<RefillUnit>().is_err());
    }

    #[test]
    fn test_refill_unit_display_round_trips() {
        for unit in [RefillUnit::Nanoseconds, RefillUnit::Hours, RefillUnit::Days] {
            assert_eq!(unit.to_string().parse::<RefillUnit>().unwrap(), unit);
        }
    }

    #[test]
    fn test_refill_unit_saturates() {
        assert_eq!(
            RefillUnit::Days.to_duration(u64::MAX),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_zero_refill_period_is_rejected() {
        let result = TokenBucket::new(&config(5, 1, 0, RefillUnit::Seconds));
        assert!(matches!(result, Err(ThrottleError::ZeroRefillPeriod)));

        let result = ThrottleLayer::new("test", &config(5, 2, 0, RefillUnit::Minutes));
        assert!(matches!(result, Err(ThrottleError::ZeroRefillPeriod)));

        // Nothing is refilled, so the period does not matter
        let bucket = TokenBucket::new(&config(5, 0, 0, RefillUnit::Seconds)).unwrap();
        assert!(!bucket.refills());
    }

    #[test]
    fn test_bucket_admits_exactly_capacity() {
        let bucket = TokenBucket::new(&config(3, 1, 10, RefillUnit::Seconds)).unwrap();

        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let bucket = TokenBucket::new(&config(0, 1, 1, RefillUnit::Seconds)).unwrap();

        assert!(!bucket.refills());
        for _ in 0..10 {
            assert!(!bucket.try_consume());
        }
    }

    #[tokio::test]
    async fn test_zero_refill_never_replenishes() {
        let bucket = TokenBucket::new(&config(2, 0, 1, RefillUnit::Milliseconds)).unwrap();

        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        // Many refill periods later the bucket is still empty
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!bucket.try_consume());
    }

    #[test]
    fn test_refill_waits_for_whole_period() {
        let bucket = TokenBucket::new(&config(1, 10, 1000, RefillUnit::Milliseconds)).unwrap();
        let start = Instant::now();

        assert!(bucket.try_consume_at(start));
        // Nothing is credited before the period boundary
        for ms in (5..950).step_by(5) {
            assert!(!bucket.try_consume_at(start + Duration::from_millis(ms)));
        }

        // Ten tokens arrive at once but the bucket only holds one
        let boundary = start + Duration::from_millis(1_050);
        assert!(bucket.try_consume_at(boundary));
        assert!(!bucket.try_consume_at(boundary));
    }

    #[test]
    fn test_partial_refill_and_period_alignment() {
        let bucket = TokenBucket::new(&config(5, 2, 10, RefillUnit::Seconds)).unwrap();
        let start = Instant::now();

        for _ in 0..5 {
            assert!(bucket.try_consume_at(start));
        }
        assert!(!bucket.try_consume_at(start));

        // 25s later: two whole periods elapsed, four tokens credited
        let later = start + Duration::from_secs(25);
        for _ in 0..4 {
            assert!(bucket.try_consume_at(later));
        }
        assert!(!bucket.try_consume_at(later));

        // The third boundary is 30s after creation, not 10s after `later`
        assert!(bucket.try_consume_at(start + Duration::from_secs(31)));
    }

    #[test]
    fn test_long_idle_refills_to_capacity_only() {
        let bucket = TokenBucket::new(&config(3, 1, 1, RefillUnit::Nanoseconds)).unwrap();
        let start = Instant::now();

        for _ in 0..3 {
            assert!(bucket.try_consume_at(start));
        }

        let later = start + Duration::from_secs(3_600);
        for _ in 0..3 {
            assert!(bucket.try_consume_at(later));
        }
        assert!(!bucket.try_consume_at(later));
    }

    #[tokio::test]
    async fn test_bucket_refills_after_period() {
        let bucket = TokenBucket::new(&config(1, 1, 50, RefillUnit::Milliseconds)).unwrap();

        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(bucket.try_consume());
    }

    #[tokio::test]
    async fn test_allowed_request_invokes_next_stage_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ThrottleLayer::new("test", &config(5, 1, 1, RefillUnit::Seconds)).unwrap();
        let service = layer.layer(counting_stage(calls.clone()));

        let response = service.oneshot(request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"downstream");
    }

    #[tokio::test]
    async fn test_requests_within_capacity_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ThrottleLayer::new("test", &config(3, 1, 1, RefillUnit::Seconds)).unwrap();
        let service = layer.layer(counting_stage(calls.clone()));

        for _ in 0..3 {
            let response = service.clone().oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_request_skips_next_stage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ThrottleLayer::new("test", &config(1, 1, 10, RefillUnit::Seconds)).unwrap();
        let service = layer.layer(counting_stage(calls.clone()));

        let first = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = service.clone().oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_layer_never_calls_next_stage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ThrottleLayer::new("test", &config(0, 1, 1, RefillUnit::Seconds)).unwrap();
        let service = layer.layer(counting_stage(calls.clone()));

        let response = service.oneshot(request()).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_layer_clones_share_one_bucket() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ThrottleLayer::new("test", &config(2, 1, 10, RefillUnit::Seconds)).unwrap();
        let first = layer.clone().layer(counting_stage(calls.clone()));
        let second = layer.layer(counting_stage(calls.clone()));

        assert_eq!(first.clone().oneshot(request()).await.unwrap().status(), StatusCode::OK);
        assert_eq!(second.clone().oneshot(request()).await.unwrap().status(), StatusCode::OK);
        assert_eq!(
            first.oneshot(request()).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let layer = ThrottleLayer::new("test", &config(1, 1, 10, RefillUnit::Seconds)).unwrap();
        let failing = service_fn(|_req: Request<Body>| async {
            Err::<Response<Body>, &'static str>("upstream exploded")
        });
        let service = layer.layer(failing);

        let result = service.oneshot(request()).await;
        assert_eq!(result.unwrap_err(), "upstream exploded");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_over_admit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = ThrottleLayer::new("test", &config(10, 1, 1, RefillUnit::Hours)).unwrap();
        let service = layer.layer(counting_stage(calls.clone()));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.oneshot(request()).await.unwrap().status() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == StatusCode::OK {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_drain_fixed_pool_exactly() {
        let bucket = Arc::new(TokenBucket::new(&config(50, 0, 1, RefillUnit::Seconds)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                tokio::spawn(async move { (0..25).filter(|_| bucket.try_consume()).count() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }
        assert_eq!(admitted, 50);
    }
}
