//! Host predicate for routes bound to virtual hosts.
//!
//! Patterns are matched label by label against the request host, without its
//! port and ignoring case:
//!
//! | Pattern label | Matches |
//! |---|---|
//! | `*` | exactly one label |
//! | `**` | zero or more labels |
//! | anything else | that label |
//!
//! So `**.abc.org` accepts `abc.org`, `www.abc.org` and `a.b.abc.org`, while
//! `*.abc.org` accepts only `www.abc.org`. Requests whose host does not match
//! are answered with `404 Not Found`, as if the route did not exist.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::debug;

/// Parsed host pattern such as `**.abc.org`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    labels: Vec<String>,
}

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            labels: pattern
                .trim()
                .trim_end_matches('.')
                .split('.')
                .map(str::to_ascii_lowercase)
                .collect(),
        }
    }

    /// Whether `host` (optionally with a port) matches the pattern.
    pub fn matches(&self, host: &str) -> bool {
        let host = strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }
        let labels: Vec<&str> = host.split('.').collect();
        let pattern: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        match_labels(&pattern, &labels)
    }
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literal, e.g. [::1]:8080
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn match_labels(pattern: &[&str], host: &[&str]) -> bool {
    match pattern.split_first() {
        None => host.is_empty(),
        Some((&"**", rest)) => (0..=host.len())
            .any(|skip| host.get(skip..).is_some_and(|tail| match_labels(rest, tail))),
        Some((&label, rest)) => match host.split_first() {
            Some((&first, remaining)) => {
                (label == "*" || label == first) && match_labels(rest, remaining)
            }
            None => false,
        },
    }
}

/// Host of a request: the `Host` header, or the URI authority for HTTP/2.
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
}

/// Layer restricting a route to requests for a matching host.
#[derive(Clone, Debug)]
pub struct HostLayer {
    pattern: Arc<HostPattern>,
}

impl HostLayer {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: Arc::new(HostPattern::new(pattern)),
        }
    }
}

impl<S> Layer<S> for HostLayer {
    type Service = HostService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HostService {
            inner,
            pattern: self.pattern.clone(),
        }
    }
}

/// Host predicate service wrapper.
#[derive(Clone)]
pub struct HostService<S> {
    inner: S,
    pattern: Arc<HostPattern>,
}

impl<S> Service<Request<Body>> for HostService<S>
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
        if request_host(&req).is_some_and(|host| self.pattern.matches(host)) {
            let clone = self.inner.clone();
            let mut inner = std::mem::replace(&mut self.inner, clone);
            return Box::pin(async move { inner.call(req).await });
        }

        debug!(
            host = ?request_host(&req),
            path = %req.uri().path(),
            "Host does not match route predicate"
        );
        Box::pin(async move {
            Ok::<_, S::Error>(StatusCode::NOT_FOUND.into_response())
        })
    }
}
