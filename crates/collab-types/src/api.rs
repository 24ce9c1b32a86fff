use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageRequest};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket gateway.
/// Tokens are issued elsewhere; this side only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    pub recipient_id: Uuid,
    pub content: String,
}

/// Result of a first-contact attempt: either the gate was open and a real
/// message was stored, or a message request was recorded instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContactOutcome {
    Message { message: Message },
    Request { request: MessageRequest },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub peer_id: Uuid,
    pub peer_name: Option<String>,
    pub last_message: Message,
    pub unread_count: u32,
}

// -- Requests --

/// Body returned by the HTTP accept endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedRequest {
    pub request: MessageRequest,
    pub message: Option<Message>,
}

// -- Errors --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
