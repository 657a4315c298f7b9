//! Forwarding of routed requests to their upstream.
//!
//! # Request
//!
//! - Path: the first `strip_prefix` segments are removed, then the optional
//!   `prefix_path` and the upstream's own base path are prepended. The query
//!   string is kept as is.
//! - Headers: end-to-end headers are copied. Hop-by-hop headers, `Host` and
//!   `Content-Length` are dropped; `X-Forwarded-For` and `X-Forwarded-Host`
//!   are extended.
//! - Body: buffered up to `MAX_REQUEST_BODY_SIZE`, `413` beyond that.
//!
//! # Response
//!
//! Status, end-to-end headers and body of the upstream are returned
//! unchanged, including upstream `5xx`. Transport failures become the gateway
//! fallback body:
//!
//! | Failure | Status |
//! |---|---|
//! | connect refused, reset, DNS | 503 |
//! | no answer within `UPSTREAM_TIMEOUT_MS` | 504 |

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Request, Uri};
use axum::response::Response;
use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::state::AppState;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Where a route sends its requests, and how the path is rewritten.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    /// Route id, used in logs and metrics
    pub name: &'static str,
    upstream: Url,
    strip_prefix: usize,
    prefix_path: Option<String>,
}

impl ProxyRoute {
    /// Create a route to `upstream` that strips `strip_prefix` leading path
    /// segments.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `upstream` is not an absolute URL.
    pub fn new(name: &'static str, upstream: &str, strip_prefix: usize) -> AppResult<Self> {
        let upstream = Url::parse(upstream)
            .map_err(|e| AppError::ConfigError(format!("Invalid upstream for {name}: {e}")))?;

        Ok(Self {
            name,
            upstream,
            strip_prefix,
            prefix_path: None,
        })
    }

    /// Prepend `prefix` to the rewritten path.
    pub fn with_prefix_path(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        self.prefix_path = (!prefix.is_empty()).then(|| prefix.to_string());
        self
    }

    /// Upstream URL for an incoming request URI.
    pub fn upstream_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();
        let base = self.upstream.path().trim_end_matches('/');
        let prefix = self.prefix_path.as_deref().unwrap_or_default();
        let path = rewrite_path(uri.path(), self.strip_prefix);

        url.set_path(&format!("{base}{prefix}{path}"));
        url.set_query(uri.query());
        url
    }
}

/// Remove the first `strip` segments of `path`.
///
/// Empty segments are ignored, a trailing slash is kept, and a fully stripped
/// path becomes `/`.
pub fn rewrite_path(path: &str, strip: usize) -> String {
    let rest: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .skip(strip)
        .collect();

    if rest.is_empty() {
        return "/".to_string();
    }

    let mut rewritten = format!("/{}", rest.join("/"));
    if path.ends_with('/') {
        rewritten.push('/');
    }
    rewritten
}

/// Forward `req` to the upstream of `route` and relay the answer.
///
/// # Errors
///
/// - `AppError::PayloadTooLarge` if the body exceeds `MAX_REQUEST_BODY_SIZE`
/// - `AppError::UpstreamTimeout` if the upstream does not answer in time
/// - `AppError::UpstreamUnavailable` for any other transport failure
pub async fn forward(state: &AppState, route: &ProxyRoute, req: Request<Body>) -> AppResult<Response> {
    let (parts, body) = req.into_parts();
    let limit = state.config.max_request_body_size;

    if let Some(length) = content_length(&parts.headers)
        && length > limit as u64
    {
        return Err(AppError::PayloadTooLarge(format!(
            "{length} bytes exceeds limit of {limit}"
        )));
    }

    // Chunked bodies are only bounded while reading
    let body = axum::body::to_bytes(body, limit)
        .await
        .map_err(|e| AppError::PayloadTooLarge(format!("failed to buffer body: {e}")))?;

    let url = route.upstream_url(&parts.uri);
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let headers = upstream_request_headers(&parts.headers, peer);

    debug!(
        route = route.name,
        method = %parts.method,
        upstream = %url,
        "Forwarding request"
    );

    let upstream = state
        .http
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| upstream_error(route, e))?;

    let status = upstream.status();
    let headers = end_to_end_headers(upstream.headers());
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| upstream_error(route, e))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn upstream_error(route: &ProxyRoute, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        warn!(route = route.name, error = %err, "Upstream timed out");
        metrics::record_upstream_failure("timeout");
        return AppError::UpstreamTimeout(format!("{}: {err}", route.name));
    }

    let kind = if err.is_connect() { "connect" } else { "transport" };
    warn!(route = route.name, kind, error = %err, "Upstream unavailable");
    metrics::record_upstream_failure(kind);
    AppError::UpstreamUnavailable(format!("{}: {err}", route.name))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy of `headers` without hop-by-hop headers, headers named in
/// `Connection`, and `Content-Length`.
pub fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_tokens: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::CONTENT_LENGTH
            || connection_tokens.iter().any(|token| token == name.as_str())
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Headers sent upstream for a client request.
pub fn upstream_request_headers(headers: &HeaderMap, peer: Option<IpAddr>) -> HeaderMap {
    let mut upstream = end_to_end_headers(headers);
    let original_host = upstream.remove(header::HOST);

    if let Some(ip) = peer {
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            upstream.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = original_host
        && !upstream.contains_key(X_FORWARDED_HOST)
    {
        upstream.insert(X_FORWARDED_HOST, host);
    }

    upstream
}
