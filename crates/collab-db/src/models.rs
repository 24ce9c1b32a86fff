//! Database row types. These map directly to SQLite rows and are kept apart
//! from the collab-types models so the storage layer stays independent.
//! Every row converts into its domain model with `into_model`.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use collab_types::api::ConversationSummary;
use collab_types::models::{Message, MessageRequest, Sponsorship, UserConnection};

/// Timestamps are stored as RFC 3339 UTC with microsecond precision, so
/// lexical order matches chronological order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

pub struct UserRow {
    pub id: String,
    pub name: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub created_at: String,
    pub status: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}

impl MessageRow {
    pub fn into_model(self) -> Result<Message> {
        Ok(Message {
            id: parse_uuid(&self.id)?,
            sender_id: parse_uuid(&self.sender_id)?,
            recipient_id: parse_uuid(&self.recipient_id)?,
            content: self.content,
            timestamp: parse_ts(&self.created_at)?,
            status: self.status.parse()?,
            delivered_at: parse_opt_ts(self.delivered_at.as_deref())?,
            read_at: parse_opt_ts(self.read_at.as_deref())?,
        })
    }
}

pub struct RequestRow {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub content: String,
    pub created_at: String,
    pub status: String,
}

impl RequestRow {
    pub fn into_model(self) -> Result<MessageRequest> {
        Ok(MessageRequest {
            id: parse_uuid(&self.id)?,
            from: parse_uuid(&self.from_id)?,
            to: parse_uuid(&self.to_id)?,
            content: self.content,
            timestamp: parse_ts(&self.created_at)?,
            status: self.status.parse()?,
        })
    }
}

pub struct ConnectionRow {
    pub id: String,
    pub user1: String,
    pub user2: String,
    pub connected_at: String,
    pub last_message_at: Option<String>,
}

impl ConnectionRow {
    pub fn into_model(self) -> Result<UserConnection> {
        Ok(UserConnection {
            id: parse_uuid(&self.id)?,
            user1: parse_uuid(&self.user1)?,
            user2: parse_uuid(&self.user2)?,
            connected_at: parse_ts(&self.connected_at)?,
            last_message_at: parse_opt_ts(self.last_message_at.as_deref())?,
        })
    }
}

pub struct SponsorshipRow {
    pub id: String,
    pub brand_id: String,
    pub influencer_id: String,
    pub status: String,
    pub created_at: String,
}

impl SponsorshipRow {
    pub fn into_model(self) -> Result<Sponsorship> {
        Ok(Sponsorship {
            id: parse_uuid(&self.id)?,
            brand_id: parse_uuid(&self.brand_id)?,
            influencer_id: parse_uuid(&self.influencer_id)?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct ConversationRow {
    pub peer_id: String,
    pub peer_name: Option<String>,
    pub last_message: MessageRow,
    pub unread: i64,
}

impl ConversationRow {
    pub fn into_model(self) -> Result<ConversationSummary> {
        Ok(ConversationSummary {
            peer_id: parse_uuid(&self.peer_id)?,
            peer_name: self.peer_name,
            last_message: self.last_message.into_model()?,
            unread_count: self.unread.max(0) as u32,
        })
    }
}
