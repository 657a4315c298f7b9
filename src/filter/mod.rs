//! Gateway filters, written as tower layers.
//!
//! A route's filter chain is a stack of layers around the proxy handler. Each
//! filter either passes the request on to the next stage or answers it
//! directly:
//!
//! ```text
//! Request → RequestId → [Throttle | RateLimit | Timing] → proxy → upstream
//!               ↓               ↓            ↓        ↓
//!         X-Request-Id         429          429    log line
//! ```
//!
//! - **Throttle**: one shared token bucket per route
//! - **Rate limit**: keyed GCRA buckets (client IP, path, or IP + API segment)
//! - **Timing**: logs how long the rest of the chain took
//! - **Request ID**: generation and propagation of `X-Request-Id`
//! - **Host**: restricts a route to a virtual host pattern

pub mod host;
pub mod ip;
pub mod rate_limit;
pub mod request_id;
pub mod throttle;
pub mod timing;

pub use host::{HostLayer, HostPattern};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, resolve_client_ip};
pub use rate_limit::{KeyResolver, RateLimitError, RequestRateLimitLayer};
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use throttle::{RefillUnit, ThrottleConfig, ThrottleError, ThrottleLayer, TokenBucket};
pub use timing::TimingLayer;
