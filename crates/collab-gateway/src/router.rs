//! Realtime message router.
//!
//! Every socket owns a [`Session`] that starts unauthenticated. The first
//! successful `auth` frame (or a token verified at upgrade time) binds it to
//! an identity and registers its handle; after that the router accepts
//! `message`, `messageRequest` and `requestAccepted` frames. A failure while
//! handling one frame is reported to that socket as an `error` event and
//! never closes the connection. Only a failed authentication does.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use collab_db::queries::AcceptOutcome;
use collab_types::api::AcceptedRequest;
use collab_types::events::{
    ChatMessageData, InboundFrame, RequestAcceptedData, RequestNotice, ServerEvent,
};
use collab_types::models::{Message, MessageRequest, MessageStatus, timestamp_now};

use crate::auth::{AuthError, Identity, verify_token};
use crate::gate::{Gate, GateError, validate_content};
use crate::registry::{CLOSE_UNAUTHORIZED, Handle, Outbound, Registry};
use crate::store::Store;

/// Per-socket state.
pub struct Session {
    handle: Handle,
    identity: Option<Identity>,
}

impl Session {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            identity: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

/// Whether the socket should stay open after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Clone)]
pub struct MessageRouter {
    store: Store,
    gate: Gate,
    registry: Registry,
    jwt_secret: Arc<str>,
}

impl MessageRouter {
    pub fn new(store: Store, registry: Registry, jwt_secret: impl Into<Arc<str>>) -> Self {
        Self {
            gate: Gate::new(store.clone()),
            store,
            registry,
            jwt_secret: jwt_secret.into(),
        }
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        verify_token(&self.jwt_secret, token)
    }

    /// Bind a verified identity to the session and register its handle.
    /// A session that was already authenticated moves its handle over to
    /// the new identity.
    pub async fn attach(&self, session: &mut Session, identity: Identity) {
        let handle = session.handle.clone();
        match session.identity.take() {
            Some(previous) => {
                info!(
                    "connection {} re-authenticated: {} -> {}",
                    handle.conn_id(),
                    previous.user_id,
                    identity.user_id
                );
                self.registry
                    .rebind(previous.user_id, identity.user_id, handle.clone())
                    .await;
            }
            None => self.registry.register(identity.user_id, handle.clone()).await,
        }

        let (user_id, name) = (identity.user_id, identity.name.clone());
        if let Err(e) = self.store.call(move |db| db.upsert_user(user_id, &name)).await {
            warn!("failed to record profile for {}: {}", user_id, e);
        }

        handle.send_event(ServerEvent::Ready {
            user_id: identity.user_id,
            name: identity.name.clone(),
        });
        info!(
            "{} ({}) authenticated on connection {}",
            identity.name,
            identity.user_id,
            handle.conn_id()
        );
        session.identity = Some(identity);
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, session: &mut Session, text: &str) -> Flow {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "connection {} dropped frame: {} -- raw: {}",
                    session.handle.conn_id(),
                    e,
                    text.chars().take(200).collect::<String>()
                );
                return Flow::Continue;
            }
        };

        let frame = match frame {
            InboundFrame::Auth { token } => return self.on_auth(session, &token).await,
            InboundFrame::Unknown => {
                warn!(
                    "connection {} sent a frame with an unrecognized type",
                    session.handle.conn_id()
                );
                return Flow::Continue;
            }
            other => other,
        };

        let Some(identity) = session.identity.clone() else {
            warn!(
                "connection {} sent {} before authenticating, ignoring",
                session.handle.conn_id(),
                frame.kind()
            );
            return Flow::Continue;
        };

        let kind = frame.kind();
        let own = &session.handle;
        let result = match frame {
            InboundFrame::Message { data } => self.on_message(&identity, own, data).await,
            InboundFrame::MessageRequest { data } => {
                self.on_message_request(&identity, own, data).await
            }
            InboundFrame::RequestAccepted { data } => {
                self.on_request_accepted(&identity, own, data).await
            }
            InboundFrame::Auth { .. } | InboundFrame::Unknown => Ok(()),
        };

        if let Err(e) = result {
            match &e {
                GateError::Persistence(_) => {
                    error!("{} {} frame failed: {}", identity.user_id, kind, e)
                }
                _ => warn!("{} {} frame rejected: {}", identity.user_id, kind, e),
            }
            own.send_event(ServerEvent::error(e.code(), e.to_string()));
        }

        Flow::Continue
    }

    /// Forget a socket once it has closed or errored.
    pub async fn disconnect(&self, conn_id: Uuid) {
        for user_id in self.registry.unregister_connection(conn_id).await {
            info!("{} disconnected (connection {})", user_id, conn_id);
        }
    }

    async fn on_auth(&self, session: &mut Session, token: &str) -> Flow {
        match self.verify(token) {
            Ok(identity) => {
                self.attach(session, identity).await;
                Flow::Continue
            }
            Err(e) => {
                warn!(
                    "connection {} failed authentication: {}",
                    session.handle.conn_id(),
                    e
                );
                session.handle.send(Outbound::Close {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "unauthorized".into(),
                });
                Flow::Close
            }
        }
    }

    async fn on_message(
        &self,
        identity: &Identity,
        own: &Handle,
        data: ChatMessageData,
    ) -> Result<(), GateError> {
        validate_content(&data.content)?;
        let sender = identity.user_id;
        let recipient = data.recipient_id;

        if recipient == sender {
            self.on_self_message(own, sender, data.content).await;
            return Ok(());
        }

        if !self.gate.can_message_freely(sender, recipient).await? {
            debug!(
                "no relationship between {} and {}, sending as a request",
                sender, recipient
            );
            return self.on_message_request(identity, own, data).await;
        }

        let message = Message::new(sender, recipient, data.content);
        let persisted = self.persist(&message).await;
        self.deliver(message, Some(own), persisted).await;
        Ok(())
    }

    /// A message addressed to its own sender closes the read-receipt loop:
    /// it is marked read straight away and every socket of that user hears
    /// about it.
    async fn on_self_message(&self, own: &Handle, user_id: Uuid, content: String) {
        let message = Message::new(user_id, user_id, content);
        let persisted = self.persist(&message).await;
        own.send_event(ServerEvent::Message(message.clone()));

        let read_at = timestamp_now();
        if persisted {
            let id = message.id;
            if let Err(e) = self.store.call(move |db| db.mark_read(id, read_at)).await {
                error!("failed to mark message {} read: {}", id, e);
            }
        }

        let reached = self
            .registry
            .send_event_to_user(
                user_id,
                ServerEvent::MessageStatusUpdate {
                    message_id: message.id,
                    status: MessageStatus::Read,
                    read_at: Some(read_at),
                },
            )
            .await;
        debug!("read update for {} sent to {} handles", message.id, reached);
    }

    async fn on_message_request(
        &self,
        identity: &Identity,
        own: &Handle,
        data: ChatMessageData,
    ) -> Result<(), GateError> {
        let request = self
            .gate
            .create_request(identity.user_id, data.recipient_id, data.content)
            .await?;

        self.announce_request(&request, identity).await;
        own.send_event(ServerEvent::MessageRequestConfirmation(request));
        Ok(())
    }

    async fn on_request_accepted(
        &self,
        identity: &Identity,
        own: &Handle,
        data: RequestAcceptedData,
    ) -> Result<(), GateError> {
        let RequestAcceptedData {
            request_id,
            from_user_id,
        } = data;
        let acceptor = identity.user_id;

        let stored = self.store.call(move |db| db.get_request(request_id)).await?;
        match stored {
            Some(request) if request.to == acceptor && request.from == from_user_id => {}
            _ => return Err(GateError::NotFound),
        }

        let outcome = self.gate.accept_request(request_id, acceptor).await?;
        let accepted = self.announce_acceptance(outcome).await;
        own.send_event(ServerEvent::RequestAcceptedConfirmation(accepted));
        Ok(())
    }

    async fn persist(&self, message: &Message) -> bool {
        let stored = message.clone();
        match self.store.call(move |db| db.insert_message(&stored)).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to persist message {}: {}", message.id, e);
                false
            }
        }
    }

    /// Fan a freshly stored message out.
    ///
    /// `echo` receives the canonical message first. If the recipient has a
    /// live handle the message is pushed there and, when it was persisted, a
    /// spawned task advances it to `delivered` and echoes the update. Without
    /// an `echo` handle the update goes to all of the sender's sockets.
    pub async fn deliver(
        &self,
        message: Message,
        echo: Option<&Handle>,
        persisted: bool,
    ) -> Option<JoinHandle<()>> {
        if let Some(own) = echo {
            own.send_event(ServerEvent::Message(message.clone()));
        }

        let pushed = self
            .registry
            .send_event_to_user(message.recipient_id, ServerEvent::Message(message.clone()))
            .await;
        if pushed == 0 {
            debug!(
                "{} offline; message {} stays {}",
                message.recipient_id, message.id, message.status
            );
            return None;
        }
        if !persisted {
            return None;
        }

        let router = self.clone();
        let echo = echo.cloned();
        Some(tokio::spawn(async move {
            router.advance_to_delivered(message, echo).await;
        }))
    }

    async fn advance_to_delivered(&self, mut message: Message, echo: Option<Handle>) {
        let id = message.id;
        let at = timestamp_now();
        match self.store.call(move |db| db.mark_delivered(id, at)).await {
            Ok(true) => {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(at);
                let sender = message.sender_id;
                let event = ServerEvent::Message(message);
                match echo {
                    Some(handle) => {
                        handle.send_event(event);
                    }
                    None => {
                        self.registry.send_event_to_user(sender, event).await;
                    }
                }
            }
            Ok(false) => debug!("message {} already past delivered", id),
            Err(e) => error!("failed to mark message {} delivered: {}", id, e),
        }
    }

    /// Push a new request to its recipient's sockets, with the sender's
    /// display name resolved.
    pub async fn announce_request(&self, request: &MessageRequest, from: &Identity) {
        let from_name = self.display_name(from).await;
        let pushed = self
            .registry
            .send_event_to_user(
                request.to,
                ServerEvent::MessageRequest(RequestNotice {
                    request: request.clone(),
                    from_name,
                }),
            )
            .await;
        debug!("message request {} pushed to {} handles", request.id, pushed);
    }

    /// Tell the original requester their request was accepted.
    pub async fn announce_acceptance(&self, outcome: AcceptOutcome) -> AcceptedRequest {
        let accepted = AcceptedRequest {
            request: outcome.request,
            message: Some(outcome.message),
        };
        self.registry
            .send_event_to_user(
                accepted.request.from,
                ServerEvent::RequestAccepted(accepted.clone()),
            )
            .await;
        accepted
    }

    /// Recipient marks a message read; the sender's sockets get a status
    /// update. Reading twice is harmless.
    pub async fn mark_read(&self, message_id: Uuid, reader: Uuid) -> Result<Message, GateError> {
        let message = self
            .store
            .call(move |db| db.get_message(message_id))
            .await?
            .filter(|m| m.recipient_id == reader)
            .ok_or(GateError::NotFound)?;

        let at = timestamp_now();
        self.store.call(move |db| db.mark_read(message_id, at)).await?;
        let updated = self
            .store
            .call(move |db| db.get_message(message_id))
            .await?
            .unwrap_or(message);

        self.registry
            .send_event_to_user(
                updated.sender_id,
                ServerEvent::MessageStatusUpdate {
                    message_id,
                    status: updated.status,
                    read_at: updated.read_at,
                },
            )
            .await;
        Ok(updated)
    }

    async fn display_name(&self, identity: &Identity) -> String {
        let user_id = identity.user_id;
        match self.store.call(move |db| db.get_user(user_id)).await {
            Ok(Some(user)) => user.name,
            Ok(None) => identity.name.clone(),
            Err(e) => {
                warn!("failed to resolve name for {}: {}", user_id, e);
                identity.name.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::auth::tests::{SECRET, token_for};
    use collab_db::Database;
    use collab_types::models::{RequestStatus, Sponsorship, SponsorshipStatus};

    struct Peer {
        id: Uuid,
        session: Session,
        rx: UnboundedReceiver<Outbound>,
    }

    fn setup() -> (MessageRouter, Store) {
        let store = Store::new(Arc::new(Database::open_in_memory().unwrap()));
        (MessageRouter::new(store.clone(), Registry::new(), SECRET), store)
    }

    async fn connect(router: &MessageRouter, name: &str) -> Peer {
        connect_as(router, Uuid::new_v4(), name).await
    }

    async fn connect_as(router: &MessageRouter, id: Uuid, name: &str) -> Peer {
        let (handle, rx) = Handle::new();
        let mut peer = Peer {
            id,
            session: Session::new(handle),
            rx,
        };
        let token = token_for(id, name, SECRET, 3600);
        let auth = serde_json::json!({ "type": "auth", "token": token });
        assert_eq!(
            router.handle_text(&mut peer.session, &auth.to_string()).await,
            Flow::Continue
        );
        let ready = next(&mut peer.rx).await;
        assert_eq!(ready["type"], "ready");
        peer
    }

    async fn next(rx: &mut UnboundedReceiver<Outbound>) -> serde_json::Value {
        let out = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        serde_json::from_str(&out.to_json().expect("data frame")).unwrap()
    }

    fn frame(kind: &str, content: &str, recipient: Uuid) -> String {
        serde_json::json!({
            "type": kind,
            "data": { "content": content, "recipientId": recipient }
        })
        .to_string()
    }

    fn accept_frame(request_id: Uuid, from: Uuid) -> String {
        serde_json::json!({
            "type": "requestAccepted",
            "data": { "requestId": request_id, "fromUserId": from }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_frames_before_auth_are_ignored() {
        let (router, store) = setup();
        let (handle, mut rx) = Handle::new();
        let mut session = Session::new(handle);
        let other = Uuid::new_v4();

        let flow = router
            .handle_text(&mut session, &frame("messageRequest", "Hi", other))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(!session.is_authenticated());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.db().count_requests(Uuid::nil(), other).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bad_auth_closes_connection() {
        let (router, _) = setup();
        let (handle, mut rx) = Handle::new();
        let mut session = Session::new(handle);

        let flow = router
            .handle_text(&mut session, r#"{"type":"auth","token":"forged"}"#)
            .await;
        assert_eq!(flow, Flow::Close);
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Close { code: CLOSE_UNAUTHORIZED, .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_keep_connection_open() {
        let (router, _) = setup();
        let mut a = connect(&router, "a").await;

        for raw in ["{not json", r#"{"type":"typing"}"#, r#"{"type":"message","data":{}}"#] {
            assert_eq!(router.handle_text(&mut a.session, raw).await, Flow::Continue);
        }
        assert!(a.rx.try_recv().is_err());
        assert_eq!(router.registry().lookup(a.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_request_handshake_end_to_end() {
        let (router, store) = setup();
        let mut a = connect(&router, "Acme Brand").await;
        let mut b = connect(&router, "Bea").await;

        // Request from A to B
        router
            .handle_text(&mut a.session, &frame("messageRequest", "Hi", b.id))
            .await;
        let pushed = next(&mut b.rx).await;
        assert_eq!(pushed["type"], "messageRequest");
        assert_eq!(pushed["data"]["fromName"], "Acme Brand");
        assert_eq!(pushed["data"]["content"], "Hi");
        let confirmation = next(&mut a.rx).await;
        assert_eq!(confirmation["type"], "messageRequestConfirmation");
        assert_eq!(confirmation["data"]["status"], "pending");
        let request_id: Uuid = confirmation["data"]["id"].as_str().unwrap().parse().unwrap();

        // Second request while the first is pending
        router
            .handle_text(&mut a.session, &frame("messageRequest", "Hello?", b.id))
            .await;
        let rejected = next(&mut a.rx).await;
        assert_eq!(rejected["type"], "error");
        assert_eq!(rejected["data"]["code"], "DuplicateRequest");
        assert_eq!(store.db().count_requests(a.id, b.id).unwrap(), 1);
        assert!(b.rx.try_recv().is_err());

        // B accepts
        router
            .handle_text(&mut b.session, &accept_frame(request_id, a.id))
            .await;
        let accepted = next(&mut a.rx).await;
        assert_eq!(accepted["type"], "requestAccepted");
        assert_eq!(accepted["data"]["request"]["status"], "accepted");
        assert_eq!(accepted["data"]["message"]["content"], "Hi");
        let confirmation = next(&mut b.rx).await;
        assert_eq!(confirmation["type"], "requestAcceptedConfirmation");

        assert_eq!(
            store.db().get_request(request_id).unwrap().unwrap().status,
            RequestStatus::Accepted
        );
        assert_eq!(store.db().count_connections(a.id, b.id).unwrap(), 1);
        let history = store.db().get_messages_between(a.id, b.id, 10, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender_id, a.id);
        assert_eq!(history[0].recipient_id, b.id);

        // Now connected: B writes back
        router
            .handle_text(&mut b.session, &frame("message", "Hello back", a.id))
            .await;
        let echo = next(&mut b.rx).await;
        assert_eq!(echo["type"], "message");
        assert_eq!(echo["data"]["status"], "sent");
        let delivered_to_a = next(&mut a.rx).await;
        assert_eq!(delivered_to_a["data"]["content"], "Hello back");
        let status_echo = next(&mut b.rx).await;
        assert_eq!(status_echo["data"]["status"], "delivered");
        assert!(status_echo["data"]["deliveredAt"].is_string());
        assert_eq!(status_echo["data"]["id"], echo["data"]["id"]);

        let id: Uuid = echo["data"]["id"].as_str().unwrap().parse().unwrap();
        let stored = store.db().get_message(id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_accept_requires_matching_parties() {
        let (router, store) = setup();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let request = router.gate().create_request(a, b, "Hi".into()).await.unwrap();
        let mut intruder = connect(&router, "mallory").await;
        let mut b = connect_as(&router, b, "b").await;

        router
            .handle_text(&mut intruder.session, &accept_frame(request.id, a))
            .await;
        assert_eq!(next(&mut intruder.rx).await["data"]["code"], "NotFound");

        router
            .handle_text(&mut b.session, &accept_frame(request.id, Uuid::new_v4()))
            .await;
        assert_eq!(next(&mut b.rx).await["data"]["code"], "NotFound");

        assert_eq!(
            store.db().get_request(request.id).unwrap().unwrap().status,
            RequestStatus::Pending
        );
        assert!(!store.db().connection_exists(a, b.id).unwrap());
    }

    #[tokio::test]
    async fn test_offline_recipient_still_persists() {
        let (router, store) = setup();
        let mut a = connect(&router, "a").await;
        let offline = Uuid::new_v4();
        store.db().insert_connection_if_absent(a.id, offline).unwrap();

        let flow = router
            .handle_text(&mut a.session, &frame("message", "you there?", offline))
            .await;
        assert_eq!(flow, Flow::Continue);

        let echo = next(&mut a.rx).await;
        assert_eq!(echo["data"]["status"], "sent");
        tokio::task::yield_now().await;
        assert!(a.rx.try_recv().is_err());

        let history = store.db().get_messages_between(a.id, offline, 10, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_sponsorship_opens_gate() {
        let (router, store) = setup();
        let mut brand = connect(&router, "brand").await;
        let mut influencer = connect(&router, "influencer").await;
        store
            .db()
            .insert_sponsorship(&Sponsorship {
                id: Uuid::new_v4(),
                brand_id: brand.id,
                influencer_id: influencer.id,
                status: SponsorshipStatus::Accepted,
                created_at: timestamp_now(),
            })
            .unwrap();

        router
            .handle_text(&mut influencer.session, &frame("message", "Draft attached", brand.id))
            .await;
        assert_eq!(next(&mut influencer.rx).await["data"]["status"], "sent");
        let pushed = next(&mut brand.rx).await;
        assert_eq!(pushed["type"], "message");
        assert_eq!(pushed["data"]["content"], "Draft attached");
        assert_eq!(next(&mut influencer.rx).await["data"]["status"], "delivered");

        assert_eq!(store.db().count_requests(influencer.id, brand.id).unwrap(), 0);
        assert_eq!(store.db().count_messages_between(brand.id, influencer.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_message_without_relationship_becomes_request() {
        let (router, store) = setup();
        let mut a = connect(&router, "a").await;
        let mut b = connect(&router, "b").await;

        router
            .handle_text(&mut a.session, &frame("message", "Hi there", b.id))
            .await;
        assert_eq!(next(&mut b.rx).await["type"], "messageRequest");
        assert_eq!(next(&mut a.rx).await["type"], "messageRequestConfirmation");
        assert_eq!(store.db().count_messages_between(a.id, b.id).unwrap(), 0);
        assert_eq!(store.db().count_requests(a.id, b.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_self_message_marks_read_on_every_device() {
        let (router, store) = setup();
        let id = Uuid::new_v4();
        let mut phone = connect_as(&router, id, "me").await;
        let mut laptop = connect_as(&router, id, "me").await;

        router
            .handle_text(&mut phone.session, &frame("message", "note to self", id))
            .await;
        let echo = next(&mut phone.rx).await;
        assert_eq!(echo["type"], "message");

        for rx in [&mut phone.rx, &mut laptop.rx] {
            let update = next(rx).await;
            assert_eq!(update["type"], "messageStatusUpdate");
            assert_eq!(update["data"]["status"], "read");
            assert_eq!(update["data"]["messageId"], echo["data"]["id"]);
            assert!(update["data"]["readAt"].is_string());
        }

        let message_id: Uuid = echo["data"]["id"].as_str().unwrap().parse().unwrap();
        let stored = store.db().get_message(message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert!(stored.read_at.is_some());
    }

    #[tokio::test]
    async fn test_self_addressed_request_is_refused() {
        let (router, store) = setup();
        let mut me = connect(&router, "me").await;

        let flow = router
            .handle_text(&mut me.session, &frame("messageRequest", "hi me", me.id))
            .await;
        assert_eq!(flow, Flow::Continue);
        let error = next(&mut me.rx).await;
        assert_eq!(error["type"], "error");
        assert_eq!(error["data"]["code"], "NotAllowed");
        assert!(me.rx.try_recv().is_err());
        assert_eq!(store.db().count_requests(me.id, me.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_still_pushes_live() {
        let (router, store) = setup();
        let mut a = connect(&router, "a").await;
        let mut b = connect(&router, "b").await;
        store.db().insert_connection_if_absent(a.id, b.id).unwrap();
        store
            .db()
            .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE messages")?))
            .unwrap();

        let flow = router
            .handle_text(&mut a.session, &frame("message", "still here", b.id))
            .await;
        assert_eq!(flow, Flow::Continue);

        let echo = next(&mut a.rx).await;
        assert_eq!(echo["type"], "message");
        assert_eq!(echo["data"]["status"], "sent");
        let pushed = next(&mut b.rx).await;
        assert_eq!(pushed["data"]["id"], echo["data"]["id"]);
        assert_eq!(pushed["data"]["status"], "sent");

        // No delivered update follows an unstored message
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recipient_on_two_devices_gets_both_pushes() {
        let (router, store) = setup();
        let mut a = connect(&router, "a").await;
        let b_id = Uuid::new_v4();
        let mut b_phone = connect_as(&router, b_id, "b").await;
        let mut b_laptop = connect_as(&router, b_id, "b").await;
        store.db().insert_connection_if_absent(a.id, b_id).unwrap();

        router
            .handle_text(&mut a.session, &frame("message", "hey", b_id))
            .await;
        assert_eq!(next(&mut b_phone.rx).await["data"]["content"], "hey");
        assert_eq!(next(&mut b_laptop.rx).await["data"]["content"], "hey");
        assert_eq!(next(&mut a.rx).await["data"]["status"], "sent");
        assert_eq!(next(&mut a.rx).await["data"]["status"], "delivered");
    }

    #[tokio::test]
    async fn test_invalid_content_is_reported() {
        let (router, _) = setup();
        let mut a = connect(&router, "a").await;
        router
            .handle_text(&mut a.session, &frame("message", "  ", Uuid::new_v4()))
            .await;
        assert_eq!(next(&mut a.rx).await["data"]["code"], "InvalidContent");
    }

    #[tokio::test]
    async fn test_reauth_rebinds_handle() {
        let (router, _) = setup();
        let mut peer = connect(&router, "first").await;
        let second = Uuid::new_v4();

        let token = token_for(second, "second", SECRET, 3600);
        let auth = serde_json::json!({ "type": "auth", "token": token });
        router.handle_text(&mut peer.session, &auth.to_string()).await;
        assert_eq!(next(&mut peer.rx).await["data"]["userId"], second.to_string());

        assert!(router.registry().lookup(peer.id).await.is_empty());
        assert_eq!(router.registry().lookup(second).await.len(), 1);
        assert_eq!(peer.session.identity().map(|i| i.user_id), Some(second));

        router.disconnect(peer.session.handle().conn_id()).await;
        assert!(router.registry().lookup(second).await.is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_notifies_sender() {
        let (router, store) = setup();
        let mut a = connect(&router, "a").await;
        let b = Uuid::new_v4();
        let message = Message::new(a.id, b, "read me");
        store.db().insert_message(&message).unwrap();

        assert!(matches!(
            router.mark_read(message.id, a.id).await,
            Err(GateError::NotFound)
        ));

        let updated = router.mark_read(message.id, b).await.unwrap();
        assert_eq!(updated.status, MessageStatus::Read);
        let update = next(&mut a.rx).await;
        assert_eq!(update["type"], "messageStatusUpdate");
        assert_eq!(update["data"]["status"], "read");
    }
}
