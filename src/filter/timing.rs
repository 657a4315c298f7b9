//! Timing filter: logs how long each request spent in the rest of the chain.
//!
//! The start instant is taken when the request enters the filter. A drop guard
//! owned by the response future emits the log line, so the duration is
//! reported whether the chain completes, fails, or is cancelled:
//!
//! ```text
//! [GET] /timing/anything completed in 42ms
//! ```
//!
//! The duration is also recorded in the `gateway_request_duration_seconds`
//! histogram.

use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::info;

use crate::metrics;

/// Timing layer for a route's filter chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimingLayer;

impl TimingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for TimingLayer {
    type Service = TimingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimingService { inner }
    }
}

/// Timing service wrapper.
#[derive(Clone)]
pub struct TimingService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for TimingService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
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
        let completion = CompletionLog {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            start: Instant::now(),
            status: None,
        };
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // Owned by the future, so it is dropped when the request ends
            let mut completion = completion;
            let result = inner.call(req).await;
            if let Ok(response) = &result {
                completion.status = Some(response.status());
            }
            result
        })
    }
}

/// Drop guard that reports the elapsed time of one request.
struct CompletionLog {
    method: Method,
    path: String,
    start: Instant,
    /// Response status, if the chain produced a response
    status: Option<StatusCode>,
}

impl Drop for CompletionLog {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let status = self
            .status
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "none".to_string());

        info!(
            method = %self.method,
            path = %self.path,
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "{}",
            completion_message(&self.method, &self.path, elapsed)
        );
        metrics::record_request_duration(self.method.as_str(), &status, elapsed.as_secs_f64());
    }
}

/// Format the completion line for a request.
pub fn completion_message(method: &Method, path: &str, elapsed: Duration) -> String {
    format!("[{method}] {path} completed in {}ms", elapsed.as_millis())
}
