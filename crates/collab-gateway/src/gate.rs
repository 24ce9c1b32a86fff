//! Relationship gate: decides whether two users may message freely, and
//! runs the message-request handshake when they may not.
//!
//! Two independent relationships open the gate: an accepted
//! [`UserConnection`](collab_types::models::UserConnection), or an active
//! (pending or accepted) sponsorship between the pair.

use tracing::{info, warn};
use uuid::Uuid;

use collab_db::queries::AcceptOutcome;
use collab_types::api::ContactOutcome;
use collab_types::events::ErrorCode;
use collab_types::models::{Message, MessageRequest};

use crate::store::Store;

pub const MAX_CONTENT_LEN: usize = 5000;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("a message request to this user is already pending")]
    DuplicateRequest,
    #[error("message request not found")]
    NotFound,
    #[error("you can only message users you are connected or sponsored with")]
    NotAllowed,
    #[error("message content must be between 1 and 5000 characters")]
    InvalidContent,
    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl GateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateRequest => ErrorCode::DuplicateRequest,
            Self::NotFound => ErrorCode::NotFound,
            Self::NotAllowed => ErrorCode::NotAllowed,
            Self::InvalidContent => ErrorCode::InvalidContent,
            Self::Persistence(_) => ErrorCode::PersistenceFailure,
        }
    }
}

pub fn validate_content(content: &str) -> Result<(), GateError> {
    if content.trim().is_empty() || content.chars().count() > MAX_CONTENT_LEN {
        return Err(GateError::InvalidContent);
    }
    Ok(())
}

#[derive(Clone)]
pub struct Gate {
    store: Store,
}

impl Gate {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Symmetric in its arguments.
    pub async fn can_message_freely(&self, a: Uuid, b: Uuid) -> Result<bool, GateError> {
        if self.store.call(move |db| db.connection_exists(a, b)).await? {
            return Ok(true);
        }
        Ok(self
            .store
            .call(move |db| db.has_active_sponsorship(a, b))
            .await?)
    }

    /// First contact from `from` to `to`: a stored message when the gate is
    /// open, otherwise a new pending request.
    pub async fn initiate_contact(
        &self,
        from: Uuid,
        to: Uuid,
        content: String,
    ) -> Result<ContactOutcome, GateError> {
        validate_content(&content)?;
        if from == to {
            return Err(GateError::NotAllowed);
        }

        if self.can_message_freely(from, to).await? {
            let message = Message::new(from, to, content);
            let stored = message.clone();
            self.store.call(move |db| db.insert_message(&stored)).await?;
            return Ok(ContactOutcome::Message { message });
        }

        let request = self.create_request(from, to, content).await?;
        Ok(ContactOutcome::Request { request })
    }

    /// Record a pending request, refusing if one is already pending for the
    /// same `from -> to` pair.
    pub async fn create_request(
        &self,
        from: Uuid,
        to: Uuid,
        content: String,
    ) -> Result<MessageRequest, GateError> {
        validate_content(&content)?;
        if from == to {
            warn!("refusing self-addressed message request from {}", from);
            return Err(GateError::NotAllowed);
        }

        let request = MessageRequest::new(from, to, content);
        let candidate = request.clone();
        let inserted = self
            .store
            .call(move |db| db.insert_request_if_none_pending(&candidate))
            .await?;

        if !inserted {
            warn!("duplicate message request {} -> {}", from, to);
            return Err(GateError::DuplicateRequest);
        }

        info!("message request {} created ({} -> {})", request.id, from, to);
        Ok(request)
    }

    pub async fn accept_request(
        &self,
        request_id: Uuid,
        accepting_user: Uuid,
    ) -> Result<AcceptOutcome, GateError> {
        let outcome = self
            .store
            .call(move |db| db.accept_request(request_id, accepting_user))
            .await?
            .ok_or(GateError::NotFound)?;

        info!(
            "message request {} accepted by {}; connection {}",
            request_id, accepting_user, outcome.connection.id
        );
        Ok(outcome)
    }

    pub async fn reject_request(
        &self,
        request_id: Uuid,
        rejecting_user: Uuid,
    ) -> Result<MessageRequest, GateError> {
        let request = self
            .store
            .call(move |db| db.reject_request(request_id, rejecting_user))
            .await?
            .ok_or(GateError::NotFound)?;

        info!("message request {} rejected by {}", request_id, rejecting_user);
        Ok(request)
    }
}
