// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;

use crate::state::{AppState, BeaconJson, ChainHandle};

/// Past rounds never change.
const IMMUTABLE_CACHE: &str = "public, max-age=604800, immutable";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chains", get(list_chains))
        .route("/{chain}/info", get(chain_info))
        .route("/{chain}/health", get(health))
        .route("/{chain}/public/latest", get(latest))
        .route("/{chain}/public/{round}", get(by_round))
        .with_state(state)
}

fn with_cache(status: StatusCode, cache: String, body: Response) -> Response {
    let mut response = body;
    *response.status_mut() = status;
    if let Ok(value) = header::HeaderValue::from_str(&cache) {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, value);
    }
    response
}

async fn list_chains(State(state): State<AppState>) -> Response {
    let hashes: Vec<String> = state
        .chains()
        .iter()
        .map(|c| c.hash_hex().to_owned())
        .collect();
    Json(hashes).into_response()
}

async fn chain_info(State(state): State<AppState>, Path(chain): Path<String>) -> Response {
    match state.resolve(&chain) {
        Some(handle) => with_cache(
            StatusCode::OK,
            IMMUTABLE_CACHE.to_owned(),
            Json(handle.info()).into_response(),
        ),
        None => not_found("unknown chain"),
    }
}

async fn health(State(state): State<AppState>, Path(chain): Path<String>) -> Response {
    let handle = match state.resolve(&chain) {
        Some(handle) => handle,
        None => return not_found("unknown chain"),
    };
    if handle.is_disabled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "beacon id disabled after a storage failure" })),
        )
            .into_response();
    }
    let current = handle.latest_round();
    let expected = handle.expected_round();
    // healthy means the latest round is the expected one or its predecessor
    let healthy = current == expected || current + 1 == expected;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({ "current": current, "expected": expected })),
    )
        .into_response()
}

async fn latest(State(state): State<AppState>, Path(chain): Path<String>) -> Response {
    let handle = match state.resolve(&chain) {
        Some(handle) => handle,
        None => return not_found("unknown chain"),
    };
    let beacon = handle.engine().last_beacon();
    if beacon.round() == 0 {
        return not_found("chain has not started");
    }
    // fresh until the next round lands, capped by one period
    let max_age = handle
        .seconds_until(beacon.round() + 1)
        .min(handle.period_secs())
        .max(1);
    with_cache(
        StatusCode::OK,
        format!("public, max-age={max_age}"),
        Json(BeaconJson::from(&beacon)).into_response(),
    )
}

async fn by_round(
    State(state): State<AppState>,
    Path((chain, round)): Path<(String, u64)>,
) -> Response {
    let handle = match state.resolve(&chain) {
        Some(handle) => handle,
        None => return not_found("unknown chain"),
    };
    let latest_round = handle.latest_round();

    if round <= latest_round {
        return match handle.engine().store().get(round).await {
            Ok(Some(beacon)) => with_cache(
                StatusCode::OK,
                IMMUTABLE_CACHE.to_owned(),
                Json(BeaconJson::from(&beacon)).into_response(),
            ),
            Ok(None) => not_found("round trimmed or evicted"),
            Err(e) => {
                debug!(round, error = %e, "store read failed");
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            }
        };
    }

    if round == latest_round + 1 {
        return wait_for_round(&handle, round).await;
    }

    // far future: tell the client when to come back
    let retry_in = handle.seconds_until(round).max(1);
    with_cache(
        StatusCode::NOT_FOUND,
        format!("public, max-age={retry_in}"),
        Json(json!({ "error": "round not yet emitted", "round": round })).into_response(),
    )
}

/// Pending-round coalescing: park on the finalization notifier until the
/// requested round lands, bounded by twice the period regardless of how
/// patient the client is.
async fn wait_for_round(handle: &ChainHandle, round: u64) -> Response {
    let mut finalized = handle.engine().subscribe_finalized();
    let deadline = Duration::from_secs(handle.period_secs().max(1) * 2);

    let waited = tokio::time::timeout(deadline, async {
        loop {
            match finalized.recv().await {
                Ok(beacon) if beacon.round() >= round => return Some(beacon),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;

    match waited {
        Ok(Some(beacon)) if beacon.round() == round => {
            Json(BeaconJson::from(&beacon)).into_response()
        }
        Ok(Some(_)) => {
            // the notifier skipped past us (catch-up); the store has it
            match handle.engine().store().get(round).await {
                Ok(Some(beacon)) => Json(BeaconJson::from(&beacon)).into_response(),
                _ => StatusCode::SERVICE_UNAVAILABLE.into_response(),
            }
        }
        Ok(None) | Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message })),
    )
        .into_response()
}
