use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use collab_gateway::auth::Identity;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_requests(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let me = identity.user_id;
    let pending = state
        .store
        .call(move |db| db.pending_requests_for(me))
        .await?;
    Ok(Json(pending))
}

/// Accept a request addressed to the caller. The requester is notified
/// live with `requestAccepted`.
pub async fn accept_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .router
        .gate()
        .accept_request(request_id, identity.user_id)
        .await?;
    let accepted = state.router.announce_acceptance(outcome).await;
    Ok(Json(accepted))
}

pub async fn reject_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let request = state
        .router
        .gate()
        .reject_request(request_id, identity.user_id)
        .await?;
    Ok(Json(request))
}
