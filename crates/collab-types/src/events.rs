use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AcceptedRequest;
use crate::models::{Message, MessageRequest, MessageStatus};

/// A text frame could not be decoded into an [`InboundFrame`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageData {
    pub content: String,
    pub recipient_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAcceptedData {
    pub request_id: Uuid,
    pub from_user_id: Uuid,
}

/// Frames sent FROM client TO server over the socket.
///
/// `auth` carries its token at the top level; every other frame nests its
/// payload under `data`. Any other `type` value lands in `Unknown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    Auth { token: String },
    Message { data: ChatMessageData },
    MessageRequest { data: ChatMessageData },
    RequestAccepted { data: RequestAcceptedData },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Message { .. } => "message",
            Self::MessageRequest { .. } => "messageRequest",
            Self::RequestAccepted { .. } => "requestAccepted",
            Self::Unknown => "unknown",
        }
    }
}

/// Machine-readable code attached to an `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    DuplicateRequest,
    NotFound,
    NotAllowed,
    InvalidContent,
    PersistenceFailure,
}

/// A message request as pushed to its recipient, with the sender's name
/// resolved for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNotice {
    #[serde(flatten)]
    pub request: MessageRequest,
    pub from_name: String,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Authentication succeeded
    Ready { user_id: Uuid, name: String },

    /// Echo to the sender or delivery to the recipient
    Message(Message),

    MessageStatusUpdate {
        message_id: Uuid,
        status: MessageStatus,
        read_at: Option<DateTime<Utc>>,
    },

    MessageRequest(RequestNotice),

    MessageRequestConfirmation(MessageRequest),

    /// Sent to the original requester
    RequestAccepted(AcceptedRequest),

    /// Sent back to the accepting party
    RequestAcceptedConfirmation(AcceptedRequest),

    /// A frame was understood but rejected
    Error { code: ErrorCode, message: String },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}
