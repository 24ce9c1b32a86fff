use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS message_requests (
            id          TEXT PRIMARY KEY,
            from_id     TEXT NOT NULL,
            to_id       TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'accepted', 'rejected'))
        );

        CREATE INDEX IF NOT EXISTS idx_requests_to
            ON message_requests(to_id, status);

        -- At most one pending request per ordered pair
        CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_pending_pair
            ON message_requests(from_id, to_id) WHERE status = 'pending';

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL,
            recipient_id    TEXT NOT NULL,
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'sent'
                            CHECK (status IN ('sent', 'delivered', 'read')),
            delivered_at    TEXT,
            read_at         TEXT,
            request_id      TEXT UNIQUE REFERENCES message_requests(id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, recipient_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_recipient
            ON messages(recipient_id, sender_id, created_at);

        CREATE TABLE IF NOT EXISTS user_connections (
            id              TEXT PRIMARY KEY,
            user1           TEXT NOT NULL,
            user2           TEXT NOT NULL,
            pair_key        TEXT NOT NULL UNIQUE,
            connected_at    TEXT NOT NULL,
            last_message_at TEXT
        );

        CREATE TABLE IF NOT EXISTS sponsorships (
            id              TEXT PRIMARY KEY,
            brand_id        TEXT NOT NULL,
            influencer_id   TEXT NOT NULL,
            status          TEXT NOT NULL
                            CHECK (status IN ('pending', 'accepted', 'rejected', 'cancelled', 'completed')),
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sponsorships_pair
            ON sponsorships(brand_id, influencer_id, status);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
