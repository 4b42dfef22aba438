//! # Streaming Transport
//!
//! WebSocket adapter over the broadcast hub: binds the hub's wire grammar
//! to `/ws/v1/stream` sessions. Each session owns one hub subscriber and
//! two half-duplex pumps: mailbox → socket and socket → hub. Capacity
//! overflow closes the socket with policy code 1008.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use warp::ws::{Message, WebSocket, Ws};
use warp::Filter;

use crate::hub::{serialize_outbound, BroadcastHub};
use tracing::{debug, info, warn};

/// WebSocket close code for "policy violation", used at capacity.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// `GET /ws/v1/stream` upgrade route.
pub fn stream_route(
    hub: Arc<BroadcastHub>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path!("ws" / "v1" / "stream")
        .and(warp::ws())
        .and(warp::any().map(move || hub.clone()))
        .map(|ws: Ws, hub: Arc<BroadcastHub>| {
            ws.on_upgrade(move |socket| session(socket, hub))
        })
}

/// One subscriber session, start to finish.
async fn session(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sink, mut source) = socket.split();

    let handle = match hub.register() {
        Ok(handle) => handle,
        Err(e) => {
            warn!(target: "stream", err = %e, "Rejecting connection at capacity");
            let _ = sink
                .send(Message::close_with(
                    CLOSE_POLICY_VIOLATION,
                    "Server at capacity",
                ))
                .await;
            let _ = sink.close().await;
            return;
        }
    };

    let connection_id = handle.id().to_string();
    let mailbox = handle.mailbox();
    info!(target: "stream", connection_id = %connection_id, "Session started");

    loop {
        tokio::select! {
            outbound = mailbox.recv() => {
                match outbound {
                    Some(message) => {
                        let text = serialize_outbound(&message);
                        if let Err(e) = sink.send(Message::text(text)).await {
                            debug!(
                                target: "stream",
                                connection_id = %connection_id,
                                err = %e,
                                "Send failed, closing session"
                            );
                            break;
                        }
                    }
                    // Mailbox closed: hub dropped us.
                    None => break,
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        if message.is_close() {
                            debug!(
                                target: "stream",
                                connection_id = %connection_id,
                                "Client closed"
                            );
                            break;
                        }
                        if let Ok(text) = message.to_str() {
                            hub.handle_client_message(&handle, text);
                        }
                        // Binary, protocol ping/pong: nothing to do.
                    }
                    Some(Err(e)) => {
                        debug!(
                            target: "stream",
                            connection_id = %connection_id,
                            err = %e,
                            "Transport error, closing session"
                        );
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    hub.unregister(&connection_id);
    let _ = sink.close().await;
    info!(target: "stream", connection_id = %connection_id, "Session ended");
}
