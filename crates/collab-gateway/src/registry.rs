use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use collab_types::events::ServerEvent;

/// Close code sent when a socket fails authentication.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// What a connection's writer task can be asked to put on the wire.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    /// Free-form `{type, data}` event, used by publishers outside the router.
    Named {
        event: String,
        data: serde_json::Value,
    },
    Close {
        code: u16,
        reason: String,
    },
}

impl Outbound {
    /// JSON text for data-carrying frames; `None` for `Close`.
    pub fn to_json(&self) -> Option<String> {
        match self {
            Self::Event(event) => serde_json::to_string(event).ok(),
            Self::Named { event, data } => {
                Some(serde_json::json!({ "type": event, "data": data }).to_string())
            }
            Self::Close { .. } => None,
        }
    }
}

/// Live handle for one socket. Cloning shares the same underlying channel.
#[derive(Debug, Clone)]
pub struct Handle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Handle {
    /// Create a handle plus the receiver its socket writer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Open until the socket's writer drops its receiver.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Fire-and-forget send, skipped if the handle has closed.
    pub fn send(&self, msg: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(msg).is_ok()
    }

    pub fn send_event(&self, event: ServerEvent) -> bool {
        self.send(Outbound::Event(event))
    }
}

/// Maps each authenticated user to every socket they currently hold open.
/// A user may be connected from several devices at once; pushes fan out to
/// all of them.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<Uuid, Vec<Handle>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle for `user_id`. Closed handles left behind by earlier
    /// sockets are pruned at the same time.
    pub async fn register(&self, user_id: Uuid, handle: Handle) {
        let mut map = self.inner.write().await;
        let handles = map.entry(user_id).or_default();
        handles.retain(|h| h.is_open() && h.conn_id != handle.conn_id);
        handles.push(handle);
        debug!("registered handle for {} ({} live)", user_id, handles.len());
    }

    /// Remove one specific handle of `user_id`. Returns whether it was present.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        let Some(handles) = map.get_mut(&user_id) else {
            return false;
        };
        let before = handles.len();
        handles.retain(|h| h.conn_id != conn_id);
        let removed = handles.len() != before;
        if handles.is_empty() {
            map.remove(&user_id);
        }
        removed
    }

    /// Remove a handle wherever it is registered. Returns the users it was
    /// registered under.
    pub async fn unregister_connection(&self, conn_id: Uuid) -> Vec<Uuid> {
        let mut map = self.inner.write().await;
        let mut owners = Vec::new();
        map.retain(|user_id, handles| {
            let before = handles.len();
            handles.retain(|h| h.conn_id != conn_id);
            if handles.len() != before {
                owners.push(*user_id);
            }
            !handles.is_empty()
        });
        owners
    }

    /// Move a handle from one identity to another (re-authentication).
    pub async fn rebind(&self, old_user: Uuid, new_user: Uuid, handle: Handle) {
        if old_user != new_user {
            self.unregister(old_user, handle.conn_id).await;
        }
        self.register(new_user, handle).await;
    }

    /// Open handles for `user_id`.
    pub async fn lookup(&self, user_id: Uuid) -> Vec<Handle> {
        self.inner
            .read()
            .await
            .get(&user_id)
            .map(|handles| handles.iter().filter(|h| h.is_open()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_open(&self, handle: &Handle) -> bool {
        handle.is_open()
    }

    /// Every open handle of every user.
    pub async fn all_open(&self) -> Vec<Handle> {
        self.inner
            .read()
            .await
            .values()
            .flatten()
            .filter(|h| h.is_open())
            .cloned()
            .collect()
    }

    /// Number of users with at least one open handle.
    pub async fn online_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|handles| handles.iter().any(Handle::is_open))
            .count()
    }

    /// Push `msg` to every open handle of `user_id`. Returns how many
    /// handles accepted it.
    pub async fn send_to_user(&self, user_id: Uuid, msg: Outbound) -> usize {
        let handles = self.lookup(user_id).await;
        handles.iter().filter(|h| h.send(msg.clone())).count()
    }

    pub async fn send_event_to_user(&self, user_id: Uuid, event: ServerEvent) -> usize {
        self.send_to_user(user_id, Outbound::Event(event)).await
    }
}
