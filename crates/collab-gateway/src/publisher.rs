use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::registry::{Outbound, Registry};

/// A sponsorship status change to push to live sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SponsorshipNotice {
    pub event: String,
    pub data: serde_json::Value,
    /// Only this user's sockets; every socket when absent.
    #[serde(default)]
    pub recipient: Option<Uuid>,
}

/// One-way notifier for the sponsorship handlers. Shares the router's
/// registry but has no persistence of its own.
#[derive(Clone)]
pub struct SponsorshipPublisher {
    registry: Registry,
}

impl SponsorshipPublisher {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Returns how many sockets the notice reached.
    pub async fn publish(&self, notice: SponsorshipNotice) -> usize {
        let SponsorshipNotice {
            event,
            data,
            recipient,
        } = notice;
        let msg = Outbound::Named { event, data };

        let reached = match recipient {
            Some(user_id) => self.registry.send_to_user(user_id, msg.clone()).await,
            None => self
                .registry
                .all_open()
                .await
                .iter()
                .filter(|h| h.send(msg.clone()))
                .count(),
        };

        if let Outbound::Named { event, .. } = &msg {
            debug!("published {} to {} handles", event, reached);
        }
        reached
    }
}
