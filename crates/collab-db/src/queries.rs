use crate::models::{
    ConnectionRow, ConversationRow, MessageRow, RequestRow, SponsorshipRow, UserRow, format_ts,
};
use crate::Database;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use collab_types::api::ConversationSummary;
use collab_types::models::{
    Message, MessageRequest, MessageStatus, RequestStatus, Sponsorship, SponsorshipStatus,
    UserConnection, pair_key, timestamp_now,
};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, recipient_id, content, created_at, status, delivered_at, read_at";
const REQUEST_COLUMNS: &str = "id, from_id, to_id, content, created_at, status";

/// Everything that happens when a pending request is accepted.
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub request: MessageRequest,
    pub connection: UserConnection,
    /// First message of the conversation, promoted from the request content.
    pub message: Message,
}

impl Database {
    // -- Users --

    /// Record or refresh a user's display name.
    pub fn upsert_user(&self, id: Uuid, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                (id.to_string(), name),
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name FROM users WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Messages --

    /// Store a message. If the two users are connected, the connection's
    /// `last_message_at` is bumped in the same call.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| insert_message_row(conn, message, None))
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message_by(conn, "id", &id.to_string()))
    }

    /// Advance a message to `delivered`. Returns false if it was already
    /// delivered or read (status never regresses).
    pub fn mark_delivered(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'delivered', delivered_at = ?2
                 WHERE id = ?1 AND status = 'sent'",
                (id.to_string(), format_ts(&at)),
            )?;
            Ok(changed > 0)
        })
    }

    /// Advance a message to `read`. Returns false if it was already read.
    pub fn mark_read(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'read', read_at = ?2
                 WHERE id = ?1 AND status IN ('sent', 'delivered')",
                (id.to_string(), format_ts(&at)),
            )?;
            Ok(changed > 0)
        })
    }

    /// Messages exchanged between two users, newest first. `before` is an
    /// exclusive cursor on the message timestamp.
    pub fn get_messages_between(
        &self,
        a: Uuid,
        b: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let before = before
                .map(|ts| format_ts(&ts))
                .unwrap_or_else(|| "9999-12-31T23:59:59.999999Z".to_string());
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE ((sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1))
                   AND created_at < ?3
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![a.to_string(), b.to_string(), before, limit],
                    message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(MessageRow::into_model).collect()
        })
    }

    pub fn count_messages_between(&self, a: Uuid, b: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE (sender_id = ?1 AND recipient_id = ?2) OR (sender_id = ?2 AND recipient_id = ?1)",
                (a.to_string(), b.to_string()),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// One summary per conversation partner, most recent conversation first.
    pub fn conversation_summaries(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.peer_id, u.name, c.id, c.sender_id, c.recipient_id, c.content,
                        c.created_at, c.status, c.delivered_at, c.read_at, c.unread
                 FROM (
                     SELECT
                         CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END AS peer_id,
                         m.id, m.sender_id, m.recipient_id, m.content, m.created_at,
                         m.status, m.delivered_at, m.read_at,
                         ROW_NUMBER() OVER (
                             PARTITION BY CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
                             ORDER BY m.created_at DESC, m.rowid DESC
                         ) AS rn,
                         SUM(CASE WHEN m.recipient_id = ?1 AND m.sender_id != ?1 AND m.status != 'read'
                                  THEN 1 ELSE 0 END) OVER (
                             PARTITION BY CASE WHEN m.sender_id = ?1 THEN m.recipient_id ELSE m.sender_id END
                         ) AS unread
                     FROM messages m
                     WHERE m.sender_id = ?1 OR m.recipient_id = ?1
                 ) c
                 LEFT JOIN users u ON u.id = c.peer_id
                 WHERE c.rn = 1
                 ORDER BY c.created_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(ConversationRow {
                        peer_id: row.get(0)?,
                        peer_name: row.get(1)?,
                        last_message: MessageRow {
                            id: row.get(2)?,
                            sender_id: row.get(3)?,
                            recipient_id: row.get(4)?,
                            content: row.get(5)?,
                            created_at: row.get(6)?,
                            status: row.get(7)?,
                            delivered_at: row.get(8)?,
                            read_at: row.get(9)?,
                        },
                        unread: row.get(10)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(ConversationRow::into_model).collect()
        })
    }

    // -- Message requests --

    /// Insert a pending request unless one already exists for `from -> to`.
    /// Returns false (and writes nothing) on a duplicate. The check and the
    /// insert run under the same connection lock.
    pub fn insert_request_if_none_pending(&self, request: &MessageRequest) -> Result<bool> {
        self.with_conn(|conn| {
            if query_pending_request(conn, request.from, request.to)?.is_some() {
                return Ok(false);
            }
            let inserted = conn.execute(
                "INSERT INTO message_requests (id, from_id, to_id, content, created_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT DO NOTHING",
                rusqlite::params![
                    request.id.to_string(),
                    request.from.to_string(),
                    request.to.to_string(),
                    request.content,
                    format_ts(&request.timestamp),
                    request.status.as_str(),
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get_request(&self, id: Uuid) -> Result<Option<MessageRequest>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {REQUEST_COLUMNS} FROM message_requests WHERE id = ?1");
            conn.query_row(&sql, [id.to_string()], request_row)
                .optional()?
                .map(RequestRow::into_model)
                .transpose()
        })
    }

    /// Pending requests addressed to `to`, oldest first.
    pub fn pending_requests_for(&self, to: Uuid) -> Result<Vec<MessageRequest>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM message_requests
                 WHERE to_id = ?1 AND status = 'pending'
                 ORDER BY created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([to.to_string()], request_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(RequestRow::into_model).collect()
        })
    }

    pub fn count_requests(&self, from: Uuid, to: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM message_requests WHERE from_id = ?1 AND to_id = ?2",
                (from.to_string(), to.to_string()),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Accept a pending request addressed to `to`.
    ///
    /// Flips the status, upserts the pair's connection and promotes the
    /// request content into the first message, all in one transaction. The
    /// greeting is keyed by request id, so replaying this never duplicates it.
    /// Returns `None` when no pending request with that id belongs to `to`.
    pub fn accept_request(&self, id: Uuid, to: Uuid) -> Result<Option<AcceptOutcome>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(mut request) = query_request_for(&tx, id, to, RequestStatus::Pending)? else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE message_requests SET status = 'accepted' WHERE id = ?1 AND status = 'pending'",
                [id.to_string()],
            )?;
            request.status = RequestStatus::Accepted;

            let now = timestamp_now();
            insert_connection_row(&tx, request.from, request.to, now)?;

            let greeting = Message {
                id: Uuid::new_v4(),
                sender_id: request.from,
                recipient_id: request.to,
                content: request.content.clone(),
                timestamp: now,
                status: MessageStatus::Sent,
                delivered_at: None,
                read_at: None,
            };
            insert_message_row(&tx, &greeting, Some(request.id))?;

            let message = query_message_by(&tx, "request_id", &request.id.to_string())?
                .ok_or_else(|| anyhow::anyhow!("greeting for request {} missing", request.id))?;
            let connection = query_connection(&tx, request.from, request.to)?
                .ok_or_else(|| anyhow::anyhow!("connection for request {} missing", request.id))?;

            tx.commit()?;

            Ok(Some(AcceptOutcome {
                request,
                connection,
                message,
            }))
        })
    }

    /// Reject a pending request addressed to `to`. Returns `None` when no
    /// such pending request exists.
    pub fn reject_request(&self, id: Uuid, to: Uuid) -> Result<Option<MessageRequest>> {
        self.with_conn(|conn| {
            let Some(mut request) = query_request_for(conn, id, to, RequestStatus::Pending)? else {
                return Ok(None);
            };
            conn.execute(
                "UPDATE message_requests SET status = 'rejected' WHERE id = ?1 AND status = 'pending'",
                [id.to_string()],
            )?;
            request.status = RequestStatus::Rejected;
            Ok(Some(request))
        })
    }

    // -- Connections --

    pub fn connection_exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        Ok(self.get_connection(a, b)?.is_some())
    }

    pub fn get_connection(&self, a: Uuid, b: Uuid) -> Result<Option<UserConnection>> {
        self.with_conn(|conn| query_connection(conn, a, b))
    }

    /// Create the connection for an unordered pair. Returns false if the pair
    /// was already connected.
    pub fn insert_connection_if_absent(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.with_conn(|conn| insert_connection_row(conn, a, b, timestamp_now()))
    }

    pub fn count_connections(&self, a: Uuid, b: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_connections
                 WHERE (user1 = ?1 AND user2 = ?2) OR (user1 = ?2 AND user2 = ?1)",
                (a.to_string(), b.to_string()),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // -- Sponsorships --
    // Owned by the sponsorship CRUD layer; the messaging gate only reads them.

    pub fn insert_sponsorship(&self, sponsorship: &Sponsorship) -> Result<()> {
        self.with_conn(|conn| {
            let created = format_ts(&sponsorship.created_at);
            conn.execute(
                "INSERT INTO sponsorships (id, brand_id, influencer_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                rusqlite::params![
                    sponsorship.id.to_string(),
                    sponsorship.brand_id.to_string(),
                    sponsorship.influencer_id.to_string(),
                    sponsorship.status.as_str(),
                    created,
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_sponsorship_status(&self, id: Uuid, status: SponsorshipStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sponsorships SET status = ?2, updated_at = ?3 WHERE id = ?1",
                (id.to_string(), status.as_str(), format_ts(&timestamp_now())),
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_sponsorship(&self, id: Uuid) -> Result<Option<Sponsorship>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, brand_id, influencer_id, status, created_at FROM sponsorships WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok(SponsorshipRow {
                        id: row.get(0)?,
                        brand_id: row.get(1)?,
                        influencer_id: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .map(SponsorshipRow::into_model)
            .transpose()
        })
    }

    /// True if a pending or accepted sponsorship links the two users, with
    /// either one in the brand role.
    pub fn has_active_sponsorship(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sponsorships
                     WHERE ((brand_id = ?1 AND influencer_id = ?2) OR (brand_id = ?2 AND influencer_id = ?1))
                       AND status IN ('pending', 'accepted')
                     LIMIT 1",
                    (a.to_string(), b.to_string()),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        status: row.get(5)?,
        delivered_at: row.get(6)?,
        read_at: row.get(7)?,
    })
}

fn request_row(row: &Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        from_id: row.get(1)?,
        to_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        status: row.get(5)?,
    })
}

fn insert_message_row(
    conn: &Connection,
    message: &Message,
    request_id: Option<Uuid>,
) -> Result<()> {
    let inserted = conn.execute(
        "INSERT INTO messages
             (id, sender_id, recipient_id, content, created_at, status, delivered_at, read_at, request_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(request_id) DO NOTHING",
        rusqlite::params![
            message.id.to_string(),
            message.sender_id.to_string(),
            message.recipient_id.to_string(),
            message.content,
            format_ts(&message.timestamp),
            message.status.as_str(),
            message.delivered_at.as_ref().map(format_ts),
            message.read_at.as_ref().map(format_ts),
            request_id.map(|id| id.to_string()),
        ],
    )?;
    if inserted == 0 {
        return Ok(());
    }

    conn.execute(
        "UPDATE user_connections SET last_message_at = ?2 WHERE pair_key = ?1",
        (
            pair_key(message.sender_id, message.recipient_id),
            format_ts(&message.timestamp),
        ),
    )?;
    Ok(())
}

fn query_message_by(conn: &Connection, column: &str, value: &str) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {column} = ?1");
    conn.query_row(&sql, [value], message_row)
        .optional()?
        .map(MessageRow::into_model)
        .transpose()
}

fn query_pending_request(
    conn: &Connection,
    from: Uuid,
    to: Uuid,
) -> Result<Option<MessageRequest>> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM message_requests
         WHERE from_id = ?1 AND to_id = ?2 AND status = 'pending'"
    );
    conn.query_row(&sql, (from.to_string(), to.to_string()), request_row)
        .optional()?
        .map(RequestRow::into_model)
        .transpose()
}

fn query_request_for(
    conn: &Connection,
    id: Uuid,
    to: Uuid,
    status: RequestStatus,
) -> Result<Option<MessageRequest>> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM message_requests
         WHERE id = ?1 AND to_id = ?2 AND status = ?3"
    );
    conn.query_row(&sql, (id.to_string(), to.to_string(), status.as_str()), request_row)
        .optional()?
        .map(RequestRow::into_model)
        .transpose()
}

fn query_connection(conn: &Connection, a: Uuid, b: Uuid) -> Result<Option<UserConnection>> {
    conn.query_row(
        "SELECT id, user1, user2, connected_at, last_message_at FROM user_connections
         WHERE pair_key = ?1",
        [pair_key(a, b)],
        |row| {
            Ok(ConnectionRow {
                id: row.get(0)?,
                user1: row.get(1)?,
                user2: row.get(2)?,
                connected_at: row.get(3)?,
                last_message_at: row.get(4)?,
            })
        },
    )
    .optional()?
    .map(ConnectionRow::into_model)
    .transpose()
}

fn insert_connection_row(conn: &Connection, a: Uuid, b: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO user_connections (id, user1, user2, pair_key, connected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(pair_key) DO NOTHING",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            a.to_string(),
            b.to_string(),
            pair_key(a, b),
            format_ts(&at),
        ],
    )?;
    Ok(inserted > 0)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
