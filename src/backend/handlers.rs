use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use tracing::{error, info, warn};

use super::{
    BackendState, DEFAULT_BREAKER_SLOW_DELAY_MS, DEFAULT_SLOW_DELAY_MS, DEFAULT_TIMEOUT_DELAY_MS,
};
use crate::models::{BackendResponse, DelayQuery, HeadersResponse};

type BackendReply = (StatusCode, Json<BackendResponse>);

pub async fn normal(State(state): State<BackendState>) -> Json<BackendResponse> {
    let request_id = state.next_request_id();
    info!(request_id, "Normal request received");

    Json(BackendResponse::success("Backend service is healthy!", request_id))
}

pub async fn slow(
    State(state): State<BackendState>,
    Query(query): Query<DelayQuery>,
) -> Json<BackendResponse> {
    let request_id = state.next_request_id();
    let delay = state.clamp_delay(query.delay.unwrap_or(DEFAULT_SLOW_DELAY_MS));
    info!(request_id, delay_ms = delay.as_millis() as u64, "Slow request received");

    tokio::time::sleep(delay).await;
    Json(
        BackendResponse::success("Slow response completed", request_id)
            .with_delay(delay.as_millis() as u64),
    )
}

pub async fn error(State(state): State<BackendState>) -> BackendReply {
    let request_id = state.next_request_id();
    error!(request_id, "Error request received, simulating failure");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(BackendResponse::error(
            "Simulated backend service failure!",
            request_id,
        )),
    )
}

pub async fn random(State(state): State<BackendState>) -> BackendReply {
    let request_id = state.next_request_id();

    if rand::random::<f64>() < 0.5 {
        warn!(request_id, "Random request failing");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(BackendResponse::error("Random failure occurred", request_id)),
        )
    } else {
        info!(request_id, "Random request succeeding");
        (
            StatusCode::OK,
            Json(BackendResponse::success("Random success", request_id)),
        )
    }
}

pub async fn timeout(
    State(state): State<BackendState>,
    Query(query): Query<DelayQuery>,
) -> Json<BackendResponse> {
    let request_id = state.next_request_id();
    let delay = state.clamp_delay(query.delay.unwrap_or(DEFAULT_TIMEOUT_DELAY_MS));
    warn!(request_id, delay_ms = delay.as_millis() as u64, "Timeout test initiated");

    tokio::time::sleep(delay).await;
    Json(
        BackendResponse::success("Request completed (but likely timed out)", request_id)
            .with_delay(delay.as_millis() as u64),
    )
}

pub async fn breaker_slow(
    State(state): State<BackendState>,
    Query(query): Query<DelayQuery>,
) -> Json<BackendResponse> {
    let request_id = state.next_breaker_request_id();
    let delay = state.clamp_delay(query.delay.unwrap_or(DEFAULT_BREAKER_SLOW_DELAY_MS));
    info!(request_id, delay_ms = delay.as_millis() as u64, "Breaker slow request received");

    tokio::time::sleep(delay).await;
    Json(
        BackendResponse::success("Slow response completed!", request_id)
            .with_delay(delay.as_millis() as u64),
    )
}

pub async fn breaker_error(State(state): State<BackendState>) -> BackendReply {
    let request_id = state.next_breaker_request_id();
    error!(request_id, "Breaker error request received, simulating failure");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(BackendResponse::error(
            "Simulated backend service error!",
            request_id,
        )),
    )
}

pub async fn breaker_random(State(state): State<BackendState>) -> BackendReply {
    let request_id = state.next_breaker_request_id();

    if rand::random::<f64>() < 0.5 {
        warn!(request_id, "Breaker random request failing");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(BackendResponse::error("Random failure occurred!", request_id)),
        )
    } else {
        info!(request_id, "Breaker random request succeeding");
        (
            StatusCode::OK,
            Json(BackendResponse::success("Random request succeeded!", request_id)),
        )
    }
}

/// Never completes; the connection stays open until the client gives up.
pub async fn breaker_timeout(State(state): State<BackendState>) -> Json<BackendResponse> {
    let request_id = state.next_breaker_request_id();
    warn!(request_id, "Breaker timeout request received, never responding");

    std::future::pending().await
}

/// Echo request headers; non UTF-8 values are replaced lossily.
pub async fn headers(State(state): State<BackendState>, headers: HeaderMap) -> Json<HeadersResponse> {
    let request_id = state.next_request_id();

    let mut echoed = BTreeMap::new();
    for (name, value) in &headers {
        echoed
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&String::from_utf8_lossy(value.as_bytes()));
            })
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    Json(HeadersResponse {
        request_id,
        headers: echoed,
    })
}
