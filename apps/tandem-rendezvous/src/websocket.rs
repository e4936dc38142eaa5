use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tandem_proto::{ClientFrame, ClientMessage, Keepalive, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::ConnectionId;
use crate::AppState;

pub async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, remote_addr))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let connection = state.registry.attach(outbox);
    counter!("tandem_connections_total", 1);
    info!(connection, remote_addr = %remote_addr, "signaling connection opened");

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection, error = %err, "dropping unencodable frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        let decoded = match message {
            Ok(Message::Text(text)) => ClientFrame::decode(&text),
            Ok(Message::Binary(data)) => ClientFrame::decode_binary(&data),
            Ok(Message::Close(frame)) => {
                debug!(
                    connection,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(connection, error = %err, "error receiving message");
                break;
            }
        };
        match decoded {
            Ok(frame) => handle_frame(&state, connection, frame),
            Err(err) => {
                counter!("tandem_protocol_errors_total", 1);
                warn!(connection, error = %err, "dropping malformed frame");
            }
        }
    }

    if let Some(peer) = state.registry.detach(connection) {
        info!(connection, peer_id = %peer, "peer disconnected without leave");
    }
    writer.abort();
    info!(connection, "signaling connection closed");
}

fn handle_frame(state: &AppState, connection: ConnectionId, frame: ClientFrame) {
    let message = match frame {
        ClientFrame::Keepalive(Keepalive::Ping) => {
            if let Err(err) = state.registry.pong(connection) {
                debug!(connection, error = %err, "pong not queued");
            }
            return;
        }
        ClientFrame::Keepalive(Keepalive::Pong) => {
            debug!(connection, "ignoring pong from client");
            return;
        }
        ClientFrame::Message(message) => message,
    };

    match message {
        ClientMessage::Join => {
            if let Err(err) = state.registry.join(connection) {
                counter!("tandem_protocol_errors_total", 1);
                warn!(connection, error = %err, "join rejected");
            }
        }
        ClientMessage::Leave => {
            if state.registry.leave(connection).is_none() {
                debug!(connection, "leave without join ignored");
            }
        }
        relay => {
            let msg_type = relay.msg_type();
            if let Some((kind, target, data)) = relay.into_relay() {
                if let Err(err) = state.registry.relay(connection, kind, target, data) {
                    counter!("tandem_relay_dropped_total", 1, "reason" => err.metric_label());
                    debug!(connection, msg_type, error = %err, "relay dropped");
                }
            }
        }
    }
}
