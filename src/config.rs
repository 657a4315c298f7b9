//! Configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables (or a `.env` file)
//! with defaults that run the gateway against a local sample backend.
//!
//! # Routes
//!
//! - `UPSTREAM_URL`: Upstream of `/api/**` and `/gateway/rate/**` (default: `http://localhost:8081`)
//! - `TIMING_UPSTREAM_URL`: Upstream of `/timing/**` (default: `http://example.com`)
//! - `HTTPBIN_URL`: Upstream of the host-bound demo routes (default: `http://httpbin.org:80`)
//! - `UPSTREAM_TIMEOUT_MS`: Upstream response timeout (default: 3000)
//!
//! # Throttle (`/api/**`)
//!
//! - `THROTTLE_CAPACITY`: Bucket capacity (default: 5)
//! - `THROTTLE_REFILL_TOKENS`: Tokens added per refill period (default: 1)
//! - `THROTTLE_REFILL_PERIOD`: Refill period length (default: 10)
//! - `THROTTLE_REFILL_UNIT`: Unit of the refill period (default: `seconds`)
//!
//! # Keyed Rate Limiting (`/gateway/rate/**`)
//!
//! - `RATE_LIMIT_REPLENISH_RATE`: Permits per second per key (default: 10)
//! - `RATE_LIMIT_BURST_CAPACITY`: Burst capacity per key (default: 20)
//! - `RATE_LIMIT_KEY_RESOLVER`: `ip`, `path` or `smart` (default: `smart`)
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarding headers are believed
//! - `RATE_LIMIT_PRUNE_INTERVAL_SECS`: How often idle keys are dropped, 0 disables (default: 60)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use reqwest::Url;

use crate::error::{AppError, AppResult};
use crate::filter::rate_limit::KeyResolver;
use crate::filter::throttle::{RefillUnit, ThrottleConfig, TokenBucket};

/// Gateway configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    /// Name reported in `X-Gateway`, `X-Proxy-By` and `/actuator/info`
    pub gateway_name: String,

    // =========================================================================
    // Upstream Configuration
    // =========================================================================
    pub upstream_url: String,

    pub timing_upstream_url: String,

    /// Upstream of `/anything/png`, `/image/webp` and `/get`
    pub httpbin_url: String,

    /// Time allowed for an upstream to answer
    pub upstream_timeout: Duration,

    /// Largest request body forwarded upstream, in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Throttle Configuration
    // =========================================================================
    pub throttle_capacity: u32,
    pub throttle_refill_tokens: u32,
    pub throttle_refill_period: u64,
    pub throttle_refill_unit: RefillUnit,

    // =========================================================================
    // Keyed Rate Limiting
    // =========================================================================
    pub rate_limit_replenish_rate: u32,
    pub rate_limit_burst_capacity: u32,
    pub rate_limit_key_resolver: KeyResolver,

    /// Trusted proxy CIDR ranges for client IP resolution.
    ///
    /// Empty means forwarding headers are always believed.
    pub trusted_proxies: Vec<String>,

    /// Interval of the idle key pruning task, zero disables it
    pub rate_limit_prune_interval: Duration,

    // =========================================================================
    // Observability
    // =========================================================================
    /// Prometheus listener port, 0 disables it (default: 9090)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a variable cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> AppResult<Self> {
        // Missing .env is fine
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let config = Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT", defaults.port)?,
            gateway_name: env::var("GATEWAY_NAME").unwrap_or(defaults.gateway_name),
            upstream_url: env::var("UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            timing_upstream_url: env::var("TIMING_UPSTREAM_URL")
                .unwrap_or(defaults.timing_upstream_url),
            httpbin_url: env::var("HTTPBIN_URL").unwrap_or(defaults.httpbin_url),
            upstream_timeout: Duration::from_millis(parse_env("UPSTREAM_TIMEOUT_MS", 3000)?),
            max_request_body_size: parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,
            throttle_capacity: parse_env("THROTTLE_CAPACITY", defaults.throttle_capacity)?,
            throttle_refill_tokens: parse_env(
                "THROTTLE_REFILL_TOKENS",
                defaults.throttle_refill_tokens,
            )?,
            throttle_refill_period: parse_env(
                "THROTTLE_REFILL_PERIOD",
                defaults.throttle_refill_period,
            )?,
            throttle_refill_unit: parse_env("THROTTLE_REFILL_UNIT", defaults.throttle_refill_unit)?,
            rate_limit_replenish_rate: parse_env(
                "RATE_LIMIT_REPLENISH_RATE",
                defaults.rate_limit_replenish_rate,
            )?,
            rate_limit_burst_capacity: parse_env(
                "RATE_LIMIT_BURST_CAPACITY",
                defaults.rate_limit_burst_capacity,
            )?,
            rate_limit_key_resolver: parse_env(
                "RATE_LIMIT_KEY_RESOLVER",
                defaults.rate_limit_key_resolver,
            )?,
            trusted_proxies: parse_list("TRUSTED_PROXIES"),
            rate_limit_prune_interval: Duration::from_secs(parse_env(
                "RATE_LIMIT_PRUNE_INTERVAL_SECS",
                defaults.rate_limit_prune_interval.as_secs(),
            )?),
            metrics_port: parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` naming the offending variable.
    pub fn validate(&self) -> AppResult<()> {
        validate_upstream("UPSTREAM_URL", &self.upstream_url)?;
        validate_upstream("TIMING_UPSTREAM_URL", &self.timing_upstream_url)?;
        validate_upstream("HTTPBIN_URL", &self.httpbin_url)?;

        if self.upstream_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "UPSTREAM_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_replenish_rate == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_REPLENISH_RATE must be greater than 0".to_string(),
            ));
        }

        if HeaderValue::from_str(&self.gateway_name).is_err() {
            return Err(AppError::ConfigError(format!(
                "GATEWAY_NAME ({:?}) is not a valid header value",
                self.gateway_name
            )));
        }

        TokenBucket::new(&self.throttle()).map_err(|e| {
            AppError::ConfigError(format!("THROTTLE_REFILL_PERIOD: {e}"))
        })?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Throttle settings of the `/api/**` route.
    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig::default()
            .with_capacity(self.throttle_capacity)
            .with_refill_tokens(self.throttle_refill_tokens)
            .with_refill_period(self.throttle_refill_period)
            .with_refill_unit(self.throttle_refill_unit)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }
}

impl Default for Config {
    fn default() -> Self {
        let throttle = ThrottleConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            gateway_name: "sample-gateway".to_string(),
            upstream_url: "http://localhost:8081".to_string(),
            timing_upstream_url: "http://example.com".to_string(),
            httpbin_url: "http://httpbin.org:80".to_string(),
            upstream_timeout: Duration::from_millis(3000),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            throttle_capacity: throttle.capacity,
            throttle_refill_tokens: throttle.refill_tokens,
            throttle_refill_period: throttle.refill_period,
            throttle_refill_unit: throttle.refill_unit,
            rate_limit_replenish_rate: 10,
            rate_limit_burst_capacity: 20,
            rate_limit_key_resolver: KeyResolver::Smart,
            trusted_proxies: vec![],
            rate_limit_prune_interval: Duration::from_secs(60),
            metrics_port: 9090,
        }
    }
}

/// Configuration of the sample backend binary.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Host address (default: "0.0.0.0")
    pub host: String,
    /// Port (default: 8081)
    pub port: u16,
    /// Upper bound for `?delay=` on the delayed endpoints
    pub max_delay: Duration,
}

impl BackendConfig {
    /// Load the backend configuration from `BACKEND_*` variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a variable cannot be parsed.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Ok(Self {
            host: env::var("BACKEND_HOST").unwrap_or(defaults.host),
            port: parse_env("BACKEND_PORT", defaults.port)?,
            max_delay: Duration::from_millis(parse_env("BACKEND_MAX_DELAY_MS", 60_000)?),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            max_delay: Duration::from_millis(60_000),
        }
    }
}

/// Parse an environment variable into the specified type with a default value.
fn parse_env<T>(name: &str, default: T) -> AppResult<T>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated list, dropping empty entries.
fn parse_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|s| split_list(&s))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Upstreams must be absolute http(s) URLs.
fn validate_upstream(name: &str, value: &str) -> AppResult<()> {
    let url = Url::parse(value)
        .map_err(|e| AppError::ConfigError(format!("Invalid {name} ({value}): {e}")))?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AppError::ConfigError(format!(
            "{name} must use http or https, got {scheme}"
        ))),
    }
}
