use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::PeerId;

/// Liveness frames. Serialized as the bare JSON strings `"ping"` and `"pong"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keepalive {
    Ping,
    Pong,
}

/// Messages sent from a peer to the rendezvous server.
///
/// On relay messages `remote_peer_id` names the intended *target*.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgType", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Register with the server and get introduced to every present peer.
    Join,
    /// Deregister; remaining peers are told via `left`.
    Leave,
    SessionDescription {
        #[serde(rename = "remotePeerId")]
        remote_peer_id: PeerId,
        data: Value,
    },
    IceCandidate {
        #[serde(rename = "remotePeerId")]
        remote_peer_id: PeerId,
        /// `None` is the end-of-candidates marker.
        #[serde(default)]
        data: Option<Value>,
    },
}

/// Messages sent from the rendezvous server to a peer.
///
/// On relay messages `remote_peer_id` names the registry-resolved *origin*.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgType", rename_all = "camelCase")]
pub enum ServerMessage {
    Greet {
        #[serde(rename = "remotePeerId")]
        remote_peer_id: PeerId,
        polite: bool,
    },
    Left {
        #[serde(rename = "remotePeerId")]
        remote_peer_id: PeerId,
    },
    SessionDescription {
        #[serde(rename = "remotePeerId")]
        remote_peer_id: PeerId,
        data: Value,
    },
    IceCandidate {
        #[serde(rename = "remotePeerId")]
        remote_peer_id: PeerId,
        #[serde(default)]
        data: Option<Value>,
    },
}

/// The two kinds of opaque payload the server relays between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayKind {
    SessionDescription,
    IceCandidate,
}

impl RelayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayKind::SessionDescription => "sessionDescription",
            RelayKind::IceCandidate => "iceCandidate",
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ClientMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            ClientMessage::Join => "join",
            ClientMessage::Leave => "leave",
            ClientMessage::SessionDescription { .. } => "sessionDescription",
            ClientMessage::IceCandidate { .. } => "iceCandidate",
        }
    }

    /// Splits a relay message into its kind, declared target and payload.
    /// Returns `None` for `join` / `leave`.
    pub fn into_relay(self) -> Option<(RelayKind, PeerId, Option<Value>)> {
        match self {
            ClientMessage::SessionDescription {
                remote_peer_id,
                data,
            } => Some((RelayKind::SessionDescription, remote_peer_id, Some(data))),
            ClientMessage::IceCandidate {
                remote_peer_id,
                data,
            } => Some((RelayKind::IceCandidate, remote_peer_id, data)),
            ClientMessage::Join | ClientMessage::Leave => None,
        }
    }
}

impl ServerMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            ServerMessage::Greet { .. } => "greet",
            ServerMessage::Left { .. } => "left",
            ServerMessage::SessionDescription { .. } => "sessionDescription",
            ServerMessage::IceCandidate { .. } => "iceCandidate",
        }
    }

    /// Builds the server-side copy of a relayed payload, stamped with the
    /// registry-resolved origin.
    pub fn relayed(kind: RelayKind, origin: PeerId, data: Option<Value>) -> Self {
        match kind {
            RelayKind::SessionDescription => ServerMessage::SessionDescription {
                remote_peer_id: origin,
                data: data.unwrap_or(Value::Null),
            },
            RelayKind::IceCandidate => ServerMessage::IceCandidate {
                remote_peer_id: origin,
                data,
            },
        }
    }
}

/// One client→server transport frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Keepalive(Keepalive),
    Message(ClientMessage),
}

/// One server→client transport frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Keepalive(Keepalive),
    Message(ServerMessage),
}

impl From<ClientMessage> for ClientFrame {
    fn from(message: ClientMessage) -> Self {
        ClientFrame::Message(message)
    }
}

impl From<ServerMessage> for ServerFrame {
    fn from(message: ServerMessage) -> Self {
        ServerFrame::Message(message)
    }
}
