//! Request ID propagation.
//!
//! Every request leaving the gateway carries an `X-Request-Id`: the client's
//! own value when it sent a usable one, a fresh UUIDv4 otherwise. The id is
//! forwarded to the upstream with the request headers and echoed back in the
//! response, so a single id follows the request through the gateway, the
//! upstream and the client logs.
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8080/api/test/normal
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID layer for the gateway's global filter stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = request_id_for(&req);
        req.headers_mut().insert(REQUEST_ID_HEADER, request_id.clone());

        if let Ok(id) = request_id.to_str() {
            debug!(request_id = %id, "Processing request");
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
            Ok(response)
        })
    }
}

/// The client's request ID if it is a non-empty visible ASCII value,
/// otherwise a new UUIDv4.
fn request_id_for<B>(req: &Request<B>) -> HeaderValue {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(text) = value.to_str()
        && !text.trim().is_empty()
    {
        return value.clone();
    }

    let generated = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value
    HeaderValue::from_str(&generated).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use tower::util::BoxCloneService;
    use tower::{ServiceExt, service_fn};

    use super::*;

    /// Next stage that remembers the request id it was given.
    fn recording_stage(
        seen: Arc<Mutex<Option<String>>>,
    ) -> BoxCloneService<Request<Body>, Response<Body>, Infallible> {
        BoxCloneService::new(service_fn(move |req: Request<Body>| {
            let seen = seen.clone();
            async move {
                let id = req
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *seen.lock().unwrap() = id;
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        }))
    }

    #[tokio::test]
    async fn test_existing_id_forwarded_and_echoed() {
        let seen = Arc::new(Mutex::new(None));
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "existing-id-123")
            .body(Body::empty())
            .unwrap();

        let response = RequestIdLayer::new()
            .layer(recording_stage(seen.clone()))
            .oneshot(req)
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("existing-id-123"));
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "existing-id-123");
    }

    #[tokio::test]
    async fn test_generated_id_forwarded_and_echoed() {
        let seen = Arc::new(Mutex::new(None));
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "  ")
            .body(Body::empty())
            .unwrap();

        let response = RequestIdLayer::new()
            .layer(recording_stage(seen.clone()))
            .oneshot(req)
            .await
            .unwrap();

        let forwarded = seen.lock().unwrap().clone().unwrap();
        assert!(Uuid::parse_str(&forwarded).is_ok());
        assert_eq!(response.headers()[REQUEST_ID_HEADER], forwarded.as_str());
    }
}
