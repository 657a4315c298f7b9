//! Management endpoints.
//!
//! # Endpoints
//!
//! - `GET /actuator` - Index of management links
//! - `GET /actuator/health` - Liveness with uptime
//! - `GET /actuator/info` - Gateway name and version

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::models::{ActuatorIndex, AppInfo, HealthResponse, InfoResponse, Link};
use crate::state::AppState;

/// Index of the management endpoints.
///
/// ```json
/// {
///   "_links": {
///     "health": { "href": "/actuator/health" },
///     "info": { "href": "/actuator/info" },
///     "self": { "href": "/actuator" }
///   }
/// }
/// ```
pub async fn index() -> Json<ActuatorIndex> {
    let links = BTreeMap::from([
        ("self".to_string(), Link::new("/actuator")),
        ("health".to_string(), Link::new("/actuator/health")),
        ("info".to_string(), Link::new("/actuator/info")),
    ]);

    Json(ActuatorIndex { links })
}

/// Health check. Always `UP` while the gateway answers.
#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        app: AppInfo {
            name: state.config.gateway_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
}
