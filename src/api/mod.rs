pub mod auth;
pub mod handlers;

use axum::middleware;
use axum::routing::{get, post};
use std::sync::Arc;

use crate::config::Config;
use crate::router::Router;

/// Shared handler state: the routing core plus the loaded configuration.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub config: Arc<Config>,
}

/// Builds the public HTTP surface. Everything except `/health` sits
/// behind the bearer-token middleware.
pub fn build_router(state: AppState) -> axum::Router {
    let protected = axum::Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/stats", get(handlers::stats))
        .route("/v1/budget/summary", post(handlers::budget_summary))
        .route("/v1/cache/clear", post(handlers::cache_clear))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    axum::Router::new()
        .merge(protected)
        .route("/health", get(handlers::health))
        .with_state(state)
}
