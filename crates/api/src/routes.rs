//! Route definitions.

use crate::auth::{AuthState, auth_middleware};
use crate::handlers;
use crate::state::AppState;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Builds the router. `/health` stays open; everything under `/api/v1` goes
/// through the API key check.
pub fn create_router(state: AppState, auth: AuthState) -> Router {
    let api = Router::new()
        .route("/status", get(handlers::status))
        .route("/positions", get(handlers::positions))
        .route("/reconcile", post(handlers::reconcile))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
