use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;

use collab_gateway::auth::bearer_token;
use collab_gateway::connection::handle_connection;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade. A token in `?token=` or the `Authorization` header is
/// verified before upgrading; without one the socket must authenticate with
/// an `auth` frame.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let header_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    let token = query.token.as_deref().or(header_token);

    let identity = match token {
        Some(token) => Some(state.router.verify(token).map_err(|e| {
            warn!("gateway handshake rejected: {}", e);
            ApiError::Unauthorized
        })?),
        None => None,
    };

    let router = state.router.clone();
    Ok(ws
        .on_upgrade(move |socket| handle_connection(socket, router, identity))
        .into_response())
}
