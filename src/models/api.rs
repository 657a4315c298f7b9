use std::collections::BTreeMap;

use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Message returned whenever an upstream cannot serve a request.
pub const FALLBACK_MESSAGE: &str = "Service temporarily unavailable. Please try again later.";

/// Body of the gateway fallback response.
///
/// ```json
/// {
///   "status": "error",
///   "message": "Service temporarily unavailable. Please try again later.",
///   "timestamp": 1705315800000,
///   "code": 503
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct FallbackResponse {
    pub status: String,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// HTTP status code mirrored in the body
    pub code: u16,
}

impl FallbackResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: "error".to_string(),
            message: FALLBACK_MESSAGE.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            code: status.as_u16(),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "UP" while the gateway is serving traffic
    pub status: String,
    /// Seconds since the gateway started
    pub uptime_seconds: u64,
}

/// A single hypermedia link in the actuator index.
#[derive(Debug, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

impl Link {
    pub fn new(href: &str) -> Self {
        Self {
            href: href.to_string(),
        }
    }
}

/// Actuator index listing the available management endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActuatorIndex {
    #[serde(rename = "_links")]
    pub links: BTreeMap<String, Link>,
}

/// Application details for `/actuator/info`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

/// Response of `/actuator/info`.
#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub app: AppInfo,
}

/// Response body of the sample backend's `/test/*` endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackendResponse {
    /// "success" or "error"
    pub status: String,
    pub message: String,
    /// Per-process request number
    pub request_id: u64,
    /// Applied delay in milliseconds, for the delayed endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl BackendResponse {
    pub fn success(message: &str, request_id: u64) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            request_id,
            delay: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn error(message: &str, request_id: u64) -> Self {
        Self {
            status: "error".to_string(),
            ..Self::success(message, request_id)
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }
}

/// Echo of the request headers seen by the sample backend.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeadersResponse {
    pub request_id: u64,
    pub headers: BTreeMap<String, String>,
}

/// Query parameters of the delayed backend endpoints.
#[derive(Debug, Deserialize)]
pub struct DelayQuery {
    /// Delay in milliseconds
    pub delay: Option<u64>,
}
