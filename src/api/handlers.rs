use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::request::{GatewayRequest, GatewayResponse};

/// The completion endpoint. Denials and provider exhaustion are HTTP 200
/// with `success = false` in the body; only the auth edge speaks in
/// transport errors.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<GatewayRequest>,
) -> Json<GatewayResponse> {
    Json(state.router.route(request).await)
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.router.system_stats().await)
}

/// Hierarchical budget view for the identity carried on the request body.
pub async fn budget_summary(
    State(state): State<AppState>,
    Json(request): Json<GatewayRequest>,
) -> Json<Value> {
    let summaries = state.router.budget_summary(&request).await;
    let alerts = state.router.budget_alerts(&request).await;
    Json(json!({ "summaries": summaries, "alerts": alerts }))
}

pub async fn cache_clear(State(state): State<AppState>) -> Json<Value> {
    state.router.clear_caches().await;
    info!("administrative cache flush");
    Json(json!({ "success": true, "message": "all cache tiers cleared" }))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "sentinel-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
