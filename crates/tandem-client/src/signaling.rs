//! The peer's single signaling transport and the per-peer channels carved out
//! of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tandem_proto::payload::{IceCandidate, SessionDescription};
use tandem_proto::{ClientFrame, ClientMessage, Keepalive, PeerId, ServerFrame, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{ClientError, NegotiationError};

const TARGET: &str = "tandem::signaling";

/// A relayed payload from one remote peer, still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteSignal {
    Description(Value),
    /// `None` is the end-of-candidates marker.
    IceCandidate(Option<Value>),
}

/// Outbound half of a per-peer channel. Every message it sends is addressed
/// to the one remote peer it was created for.
#[derive(Debug, Clone)]
pub struct SignalingChannel {
    remote_peer_id: PeerId,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

impl SignalingChannel {
    pub fn new(remote_peer_id: PeerId, outbound: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            remote_peer_id,
            outbound,
        }
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.remote_peer_id
    }

    pub fn send_description(&self, description: &SessionDescription) -> Result<(), NegotiationError> {
        let message = ClientMessage::SessionDescription {
            remote_peer_id: self.remote_peer_id,
            data: description.to_value()?,
        };
        self.send(message)
    }

    pub fn send_ice_candidate(
        &self,
        candidate: Option<&IceCandidate>,
    ) -> Result<(), NegotiationError> {
        let message = ClientMessage::IceCandidate {
            remote_peer_id: self.remote_peer_id,
            data: candidate.map(IceCandidate::to_value).transpose()?,
        };
        self.send(message)
    }

    fn send(&self, message: ClientMessage) -> Result<(), NegotiationError> {
        self.outbound
            .send(message.into())
            .map_err(|_| NegotiationError::ChannelClosed)
    }
}

/// Everything needed to start negotiating with a newly greeted peer.
#[derive(Debug)]
pub struct Introduction {
    pub peer: PeerId,
    /// The local registration the greet belongs to. Bumped by every leave.
    pub registration: u64,
    pub polite: bool,
    pub channel: SignalingChannel,
    pub signals: mpsc::UnboundedReceiver<RemoteSignal>,
}

#[derive(Debug)]
pub enum SocketEvent {
    Greeted(Introduction),
    Left(PeerId),
    /// The transport is gone. Every per-peer signal stream has ended.
    Closed,
}

/// Counts keepalive round trips so frames the server sent before it saw our
/// `leave` can be told apart from those sent after it. The server answers
/// pings in order, so once the pong for the ping queued right behind `leave`
/// is in, nothing from the previous registration is left on the wire.
#[derive(Debug, Default)]
struct PingFence {
    counts: Mutex<PingCounts>,
}

#[derive(Debug, Default)]
struct PingCounts {
    sent: u64,
    answered: u64,
    fence: u64,
}

impl PingFence {
    fn ping(&self, outbound: &mpsc::UnboundedSender<ClientFrame>) -> bool {
        let mut counts = self.counts.lock();
        if outbound.send(ClientFrame::Keepalive(Keepalive::Ping)).is_err() {
            return false;
        }
        counts.sent += 1;
        true
    }

    fn raise(&self, outbound: &mpsc::UnboundedSender<ClientFrame>) -> bool {
        let mut counts = self.counts.lock();
        if outbound.send(ClientFrame::Keepalive(Keepalive::Ping)).is_err() {
            return false;
        }
        counts.sent += 1;
        counts.fence = counts.sent;
        true
    }

    fn answered(&self) {
        let mut counts = self.counts.lock();
        counts.answered = (counts.answered + 1).min(counts.sent);
    }

    fn is_raised(&self) -> bool {
        let counts = self.counts.lock();
        counts.answered < counts.fence
    }
}

struct PeerRoute {
    registration: u64,
    signals: mpsc::UnboundedSender<RemoteSignal>,
}

struct SocketInner {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    channels: Mutex<HashMap<PeerId, PeerRoute>>,
    registration: AtomicU64,
    fence: Arc<PingFence>,
    events: mpsc::UnboundedSender<SocketEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// The one signaling transport of a peer. Demultiplexes relayed traffic by
/// origin into per-peer channels, in arrival order.
#[derive(Clone)]
pub struct SignalingSocket {
    inner: Arc<SocketInner>,
}

impl SignalingSocket {
    /// Opens the websocket at `url` and starts the writer, reader and
    /// keepalive tasks.
    pub async fn connect(
        url: &Url,
        keepalive_interval: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SocketEvent>), ClientError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ClientError::Connect(err.to_string()))?;
        tracing::debug!(target: TARGET, url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (socket, events) = Self::detached(outbound_tx);

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: TARGET, error = %err, "dropping unencodable frame");
                        continue;
                    }
                };
                tracing::trace!(target: TARGET, event = "ws_out", len = text.len());
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let decoded = match message {
                    Ok(Message::Text(text)) => ServerFrame::decode(&text),
                    Ok(Message::Binary(data)) => ServerFrame::decode_binary(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: TARGET, "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: TARGET, "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match decoded {
                    Ok(frame) => reader_socket.dispatch(frame),
                    Err(err) => {
                        tracing::warn!(target: TARGET, error = %err, "ignoring malformed frame")
                    }
                }
            }
            reader_socket.mark_closed();
        });

        let keepalive_outbound = socket.inner.outbound.clone();
        let fence = Arc::clone(&socket.inner.fence);
        let keepalive = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + keepalive_interval;
            let mut ticker = tokio::time::interval_at(start, keepalive_interval);
            loop {
                ticker.tick().await;
                if !fence.ping(&keepalive_outbound) {
                    break;
                }
            }
        });

        socket.inner.tasks.lock().extend([writer, reader, keepalive]);
        Ok((socket, events))
    }

    /// A socket with no transport attached; outbound frames land on
    /// `outbound` and inbound frames are fed through [`Self::dispatch`].
    pub fn detached(
        outbound: mpsc::UnboundedSender<ClientFrame>,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let socket = Self {
            inner: Arc::new(SocketInner {
                outbound,
                channels: Mutex::new(HashMap::new()),
                registration: AtomicU64::new(0),
                fence: Arc::new(PingFence::default()),
                events: events_tx,
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };
        (socket, events_rx)
    }

    pub fn join(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::Join.into())
    }

    /// Announces departure and starts a new registration. Channels of the
    /// old one end, and greets the server sent before it saw the leave are
    /// dropped until the fence ping queued behind it is answered.
    pub fn leave(&self) -> Result<(), ClientError> {
        let mut channels = self.inner.channels.lock();
        self.send(ClientMessage::Leave.into())?;
        self.inner.registration.fetch_add(1, Ordering::AcqRel);
        channels.clear();
        if !self.inner.fence.raise(&self.inner.outbound) {
            return Err(ClientError::TransportClosed);
        }
        Ok(())
    }

    pub fn registration(&self) -> u64 {
        self.inner.registration.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Routes one inbound frame. Relayed payloads go to the channel of their
    /// origin; traffic from peers without a channel is dropped.
    pub fn dispatch(&self, frame: ServerFrame) {
        let message = match frame {
            ServerFrame::Keepalive(Keepalive::Pong) => {
                tracing::trace!(target: TARGET, "pong");
                self.inner.fence.answered();
                return;
            }
            ServerFrame::Keepalive(Keepalive::Ping) => {
                tracing::debug!(target: TARGET, "ignoring ping from server");
                return;
            }
            ServerFrame::Message(message) => message,
        };
        match message {
            ServerMessage::Greet {
                remote_peer_id,
                polite,
            } => self.open_channel(remote_peer_id, polite),
            ServerMessage::Left { remote_peer_id } => {
                if self.inner.channels.lock().remove(&remote_peer_id).is_some() {
                    let _ = self.inner.events.send(SocketEvent::Left(remote_peer_id));
                } else {
                    tracing::debug!(target: TARGET, peer = %remote_peer_id, "left from unknown peer");
                }
            }
            ServerMessage::SessionDescription {
                remote_peer_id,
                data,
            } => self.route(remote_peer_id, RemoteSignal::Description(data)),
            ServerMessage::IceCandidate {
                remote_peer_id,
                data,
            } => self.route(remote_peer_id, RemoteSignal::IceCandidate(data)),
        }
    }

    /// Drops the channel for `peer` so its signal stream ends. Used when the
    /// local side tears a connection down on its own.
    pub fn forget(&self, peer: PeerId) {
        self.inner.channels.lock().remove(&peer);
    }

    /// Like [`Self::forget`], but leaves a channel opened by a later
    /// registration alone.
    pub fn forget_registered(&self, peer: PeerId, registration: u64) {
        let mut channels = self.inner.channels.lock();
        if channels
            .get(&peer)
            .is_some_and(|route| route.registration == registration)
        {
            channels.remove(&peer);
        }
    }

    /// Stops the transport tasks and ends every per-peer signal stream.
    pub fn close(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.mark_closed();
    }

    fn mark_closed(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.channels.lock().clear();
        tracing::debug!(target: TARGET, "signaling transport closed");
        let _ = self.inner.events.send(SocketEvent::Closed);
    }

    fn open_channel(&self, peer: PeerId, polite: bool) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let registration = {
            let mut channels = self.inner.channels.lock();
            if self.inner.fence.is_raised() {
                tracing::debug!(target: TARGET, peer = %peer, "greet from previous registration dropped");
                return;
            }
            let registration = self.registration();
            if channels
                .get(&peer)
                .is_some_and(|route| route.registration == registration)
            {
                tracing::warn!(target: TARGET, peer = %peer, "duplicate greet ignored");
                return;
            }
            channels.insert(
                peer,
                PeerRoute {
                    registration,
                    signals: signals_tx,
                },
            );
            registration
        };
        tracing::debug!(target: TARGET, peer = %peer, polite, registration, "greeted");
        let introduction = Introduction {
            peer,
            registration,
            polite,
            channel: SignalingChannel::new(peer, self.inner.outbound.clone()),
            signals: signals_rx,
        };
        let _ = self.inner.events.send(SocketEvent::Greeted(introduction));
    }

    fn route(&self, origin: PeerId, signal: RemoteSignal) {
        let channels = self.inner.channels.lock();
        match channels.get(&origin) {
            Some(route) => {
                let _ = route.signals.send(signal);
            }
            None => {
                tracing::debug!(target: TARGET, peer = %origin, "dropping signal from unknown peer")
            }
        }
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::TransportClosed);
        }
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| ClientError::TransportClosed)
    }
}
