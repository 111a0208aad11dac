//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use syncdb_core::HubStatsSnapshot;

use crate::sources::SourceStatus;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub hub: HubStatsSnapshot,
    pub sources: Vec<SourceStatus>,
}

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let sources = state.sources.statuses();
    let healthy = !sources.is_empty() && sources.iter().all(|s| s.running);

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        hub: state.hub.stats().snapshot(),
        sources,
    })
}
