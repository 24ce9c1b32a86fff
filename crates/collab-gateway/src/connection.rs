use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::registry::{CLOSE_UNAUTHORIZED, Handle, Outbound};
use crate::router::{Flow, MessageRouter, Session};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// An unauthenticated socket must send `auth` within this window.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer gets to flush a queued Close after the reader stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive one WebSocket until it closes.
///
/// `identity` is set when the token was already verified at upgrade time;
/// otherwise the socket starts unauthenticated and must send an `auth` frame.
pub async fn handle_connection(
    socket: WebSocket,
    router: MessageRouter,
    identity: Option<Identity>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound_rx) = Handle::new();
    let conn_id = handle.conn_id();
    let mut session = Session::new(handle);

    if let Some(identity) = identity {
        router.attach(&mut session, identity).await;
    } else {
        debug!("connection {} opened, awaiting auth", conn_id);
    }

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Writer: drains the handle's channel to the socket, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };

                    if let Outbound::Close { code, reason } = msg {
                        let frame = CloseFrame { code, reason: reason.into() };
                        let _ = sender.send(Message::Close(Some(frame))).await;
                        break;
                    }

                    let Some(text) = msg.to_json() else { continue };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(
                                "Heartbeat timeout (missed {} pongs), dropping connection",
                                missed_heartbeats
                            );
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: frames are handled one at a time, in arrival order
    let recv_router = router.clone();
    let mut recv_task = tokio::spawn(async move {
        let auth_deadline = Instant::now() + AUTH_TIMEOUT;

        loop {
            let next = if session.is_authenticated() {
                receiver.next().await
            } else {
                match tokio::time::timeout_at(auth_deadline, receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!("connection {} did not authenticate in time, closing", conn_id);
                        session.handle().send(Outbound::Close {
                            code: CLOSE_UNAUTHORIZED,
                            reason: "authentication timeout".into(),
                        });
                        break;
                    }
                }
            };

            let Some(Ok(msg)) = next else { break };
            match msg {
                Message::Text(text) => {
                    if recv_router.handle_text(&mut session, text.as_str()).await == Flow::Close {
                        break;
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish. Unregistering drops the registry's
    // copy of the handle, which lets the writer drain and stop on its own.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            router.disconnect(conn_id).await;
        }
        _ = &mut recv_task => {
            router.disconnect(conn_id).await;
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }

    info!("connection {} closed", conn_id);
}
