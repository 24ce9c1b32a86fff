use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::ws_upgrade;
use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{messages, requests};

pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/messages/{id}", get(messages::get_messages))
        .route("/messages/{id}/read", post(messages::mark_read))
        .route("/conversations", get(messages::get_conversations))
        .route("/message-requests", get(requests::list_requests))
        .route("/message-requests/{id}/accept", post(requests::accept_request))
        .route("/message-requests/{id}/reject", post(requests::reject_request))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/gateway", get(ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
