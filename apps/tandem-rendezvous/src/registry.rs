//! Server-side roster of joined peers.
//!
//! All mutations run under one lock, and every frame they fan out is queued
//! while that lock is held, so every peer observes joins, leaves and relays
//! in the same total order.

use std::collections::{BTreeMap, HashMap};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use tandem_proto::{Keepalive, PeerId, RelayKind, ServerFrame, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Server-internal handle of one attached transport, joined or not.
pub type ConnectionId = u64;

/// Outbound queue of one transport, drained by its writer task.
pub type Outbox = mpsc::UnboundedSender<ServerFrame>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is not attached")]
    UnknownConnection(ConnectionId),
    #[error("connection {connection} already joined as peer {peer}")]
    AlreadyJoined {
        connection: ConnectionId,
        peer: PeerId,
    },
    #[error("connection {0} has not joined")]
    NotJoined(ConnectionId),
    #[error("peer {0} addressed a relay to itself")]
    SelfRelay(PeerId),
    #[error("relay target {0} is not registered")]
    UnknownTarget(PeerId),
}

impl RegistryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RegistryError::UnknownConnection(_) => "unknown_connection",
            RegistryError::AlreadyJoined { .. } => "already_joined",
            RegistryError::NotJoined(_) => "not_joined",
            RegistryError::SelfRelay(_) => "self_relay",
            RegistryError::UnknownTarget(_) => "unknown_target",
        }
    }
}

struct Connection {
    outbox: Outbox,
    peer: Option<PeerId>,
}

impl Connection {
    fn send(&self, frame: ServerFrame) {
        // A closed queue means the transport is already going away.
        let _ = self.outbox.send(frame);
    }
}

#[derive(Default)]
struct RegistryInner {
    next_connection: ConnectionId,
    next_peer: PeerId,
    connections: HashMap<ConnectionId, Connection>,
    peers: BTreeMap<PeerId, ConnectionId>,
}

#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transport. It receives nothing until it joins.
    pub fn attach(&self, outbox: Outbox) -> ConnectionId {
        let mut inner = self.inner.lock();
        let connection = inner.next_connection;
        inner.next_connection += 1;
        inner.connections.insert(
            connection,
            Connection {
                outbox,
                peer: None,
            },
        );
        connection
    }

    /// Forgets a transport, leaving first if it had joined.
    pub fn detach(&self, connection: ConnectionId) -> Option<PeerId> {
        let mut inner = self.inner.lock();
        let peer = inner.leave(connection);
        inner.connections.remove(&connection);
        peer
    }

    /// Assigns a fresh id and cross-introduces the newcomer with every peer
    /// already present. The newcomer is impolite toward all of them.
    pub fn join(&self, connection: ConnectionId) -> Result<PeerId, RegistryError> {
        let mut inner = self.inner.lock();
        let state = inner
            .connections
            .get(&connection)
            .ok_or(RegistryError::UnknownConnection(connection))?;
        if let Some(peer) = state.peer {
            return Err(RegistryError::AlreadyJoined { connection, peer });
        }

        let peer = inner.next_peer;
        inner.next_peer = peer.next();

        let inner = &mut *inner;
        let newcomer = &inner.connections[&connection];
        for (&existing, existing_connection) in &inner.peers {
            inner.connections[existing_connection].send(greet(peer, true));
            newcomer.send(greet(existing, false));
        }
        inner.peers.insert(peer, connection);
        if let Some(state) = inner.connections.get_mut(&connection) {
            state.peer = Some(peer);
        }

        counter!("tandem_joins_total", 1);
        gauge!("tandem_peers_active", inner.peers.len() as f64);
        info!(peer_id = %peer, connection, peers = inner.peers.len(), "peer joined");
        Ok(peer)
    }

    /// Deregisters the peer on `connection` and tells everyone else. Returns
    /// `None` when the transport had not joined.
    pub fn leave(&self, connection: ConnectionId) -> Option<PeerId> {
        self.inner.lock().leave(connection)
    }

    /// Forwards `data` to `target`, stamped with the sender's registered id.
    pub fn relay(
        &self,
        connection: ConnectionId,
        kind: RelayKind,
        target: PeerId,
        data: Option<Value>,
    ) -> Result<(), RegistryError> {
        let inner = self.inner.lock();
        let origin = inner
            .connections
            .get(&connection)
            .ok_or(RegistryError::UnknownConnection(connection))?
            .peer
            .ok_or(RegistryError::NotJoined(connection))?;
        if origin == target {
            return Err(RegistryError::SelfRelay(origin));
        }
        let target_connection = inner
            .peers
            .get(&target)
            .ok_or(RegistryError::UnknownTarget(target))?;
        inner.connections[target_connection]
            .send(ServerMessage::relayed(kind, origin, data).into());
        counter!("tandem_relayed_total", 1, "kind" => kind.as_str());
        debug!(from = %origin, to = %target, %kind, "relayed");
        Ok(())
    }

    /// Answers a keepalive on `connection`. Works before join.
    pub fn pong(&self, connection: ConnectionId) -> Result<(), RegistryError> {
        let inner = self.inner.lock();
        inner
            .connections
            .get(&connection)
            .ok_or(RegistryError::UnknownConnection(connection))?
            .send(ServerFrame::Keepalive(Keepalive::Pong));
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.lock().peers.keys().copied().collect()
    }
}

impl RegistryInner {
    fn leave(&mut self, connection: ConnectionId) -> Option<PeerId> {
        let peer = self.connections.get_mut(&connection)?.peer.take()?;
        self.peers.remove(&peer);
        for remaining in self.peers.values() {
            self.connections[remaining].send(
                ServerMessage::Left {
                    remote_peer_id: peer,
                }
                .into(),
            );
        }
        counter!("tandem_leaves_total", 1);
        gauge!("tandem_peers_active", self.peers.len() as f64);
        info!(peer_id = %peer, connection, peers = self.peers.len(), "peer left");
        Some(peer)
    }
}

fn greet(remote_peer_id: PeerId, polite: bool) -> ServerFrame {
    ServerMessage::Greet {
        remote_peer_id,
        polite,
    }
    .into()
}
