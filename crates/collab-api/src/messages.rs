use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use collab_gateway::auth::Identity;
use collab_gateway::gate::GateError;
use collab_types::api::{ContactOutcome, SendMessageRequest};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination: pass the `timestamp` of the oldest message
    /// from the previous page to fetch older messages.
    pub before: Option<DateTime<Utc>>,
}

fn default_limit() -> u32 {
    50
}

/// History with one peer, newest first. Only available while the gate
/// between the two users is open.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let me = identity.user_id;
    if !state.router.gate().can_message_freely(me, peer_id).await? {
        return Err(GateError::NotAllowed.into());
    }

    let limit = query.limit.clamp(1, 200);
    let before = query.before;
    let messages = state
        .store
        .call(move |db| db.get_messages_between(me, peer_id, limit, before))
        .await?;

    Ok(Json(messages))
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let me = identity.user_id;
    let summaries = state
        .store
        .call(move |db| db.conversation_summaries(me))
        .await?;
    Ok(Json(summaries))
}

/// Send without a live socket. Goes through the gate: an open gate stores
/// and pushes a real message, a closed one records a message request.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state
        .router
        .gate()
        .initiate_contact(identity.user_id, req.recipient_id, req.content)
        .await?;

    match &outcome {
        ContactOutcome::Message { message } => {
            state.router.deliver(message.clone(), None, true).await;
        }
        ContactOutcome::Request { request } => {
            state.router.announce_request(request, &identity).await;
        }
    }

    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.router.mark_read(message_id, identity.user_id).await?;
    Ok(Json(message))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tower::ServiceExt;

    use super::*;
    use crate::routes::app;
    use crate::state::AppStateInner;
    use collab_db::Database;
    use collab_types::api::Claims;
    use collab_types::models::{Message, Sponsorship, SponsorshipStatus, timestamp_now};

    const SECRET: &str = "api-test-secret";

    fn token(user_id: Uuid) -> String {
        let claims = Claims {
            sub: user_id,
            name: format!("user-{}", &user_id.to_string()[..8]),
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn request(
        method: &str,
        uri: &str,
        user: Uuid,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token(user)));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requires_bearer_token() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let response = app(state)
            .oneshot(Request::builder().uri("/conversations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_history_is_gated() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let router = app(state.clone());

        let response = router
            .clone()
            .oneshot(request("GET", &format!("/messages/{}", b), a, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        state.store.db().insert_connection_if_absent(a, b).unwrap();
        state.store.db().insert_message(&Message::new(b, a, "hi")).unwrap();

        let response = router
            .oneshot(request("GET", &format!("/messages/{}", b), a, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let messages = body_json(response).await;
        assert_eq!(messages.as_array().unwrap().len(), 1);
        assert_eq!(messages[0]["content"], "hi");
    }

    #[tokio::test]
    async fn test_send_creates_request_then_conflicts() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let router = app(state.clone());
        let body = serde_json::json!({ "recipientId": b, "content": "Hi" });

        let response = router
            .clone()
            .oneshot(request("POST", "/messages", a, Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["kind"], "request");
        assert_eq!(json["request"]["status"], "pending");

        let response = router
            .oneshot(request("POST", "/messages", a, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_json(response).await["error"].as_str().unwrap().contains("pending"));
        assert_eq!(state.store.db().count_requests(a, b).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_to_sponsored_peer_is_a_message() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let (brand, influencer) = (Uuid::new_v4(), Uuid::new_v4());
        state
            .store
            .db()
            .insert_sponsorship(&Sponsorship {
                id: Uuid::new_v4(),
                brand_id: brand,
                influencer_id: influencer,
                status: SponsorshipStatus::Pending,
                created_at: timestamp_now(),
            })
            .unwrap();

        let body = serde_json::json!({ "recipientId": influencer, "content": "Brief attached" });
        let response = app(state.clone())
            .oneshot(request("POST", "/messages", brand, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["kind"], "message");
        assert_eq!(json["message"]["status"], "sent");
        assert_eq!(state.store.db().count_requests(brand, influencer).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_to_self_is_forbidden() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let me = Uuid::new_v4();
        let body = serde_json::json!({ "recipientId": me, "content": "note to self" });
        let response = app(state.clone())
            .oneshot(request("POST", "/messages", me, Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.store.db().count_requests(me, me).unwrap(), 0);
        assert_eq!(state.store.db().count_messages_between(me, me).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_content_is_bad_request() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let body = serde_json::json!({ "recipientId": Uuid::new_v4(), "content": "" });
        let response = app(state)
            .oneshot(request("POST", "/messages", Uuid::new_v4(), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_conversations_and_mark_read() {
        let state = AppStateInner::new(Database::open_in_memory().unwrap(), SECRET);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let message = Message::new(b, a, "unread");
        state.store.db().insert_message(&message).unwrap();
        let router = app(state.clone());

        let response = router
            .clone()
            .oneshot(request("GET", "/conversations", a, None))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json[0]["peerId"], b.to_string());
        assert_eq!(json[0]["unreadCount"], 1);

        let response = router
            .clone()
            .oneshot(request("POST", &format!("/messages/{}/read", message.id), b, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .clone()
            .oneshot(request("POST", &format!("/messages/{}/read", message.id), a, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "read");

        let response = router
            .oneshot(request("GET", "/conversations", a, None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await[0]["unreadCount"], 0);
    }
}
