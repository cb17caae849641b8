//! Status HTTP endpoints: liveness plus a small debug snapshot.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

use crate::beacon::BeaconStore;
use crate::relay::RelayMetrics;

#[derive(Clone)]
pub struct StatusState {
    pub store: BeaconStore,
    pub metrics: Arc<RelayMetrics>,
    pub started: Instant,
}

pub fn app(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/debug/stats", get(stats))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(state): State<StatusState>) -> Json<serde_json::Value> {
    let beacons = state.store.beacon_count().unwrap_or(0);
    Json(json!({
        "uptime_secs": state.started.elapsed().as_secs(),
        "beacons": beacons,
        "gauges": state.metrics.snapshot(),
    }))
}
