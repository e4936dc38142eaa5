//! One supervisor per local session: owns the local tracks and one
//! negotiation engine per greeted peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_proto::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{ClientError, NegotiationError};
use crate::media::{LocalMedia, MediaEngineFactory, RemoteTrack, TrackKind};
use crate::negotiation::{NegotiationEngine, Role};
use crate::signaling::{Introduction, SignalingSocket, SocketEvent};

const TARGET: &str = "tandem::supervisor";

/// What the application hears about its session.
#[derive(Debug)]
pub enum SessionEvent {
    RemoteConnected { peer: PeerId, polite: bool },
    RemoteDisconnected { peer: PeerId },
    RemoteTrack { peer: PeerId, track: RemoteTrack },
    NegotiationFailed { peer: PeerId, error: NegotiationError },
    SignalingClosed,
}

pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

struct SupervisorInner {
    socket: SignalingSocket,
    factory: Arc<dyn MediaEngineFactory>,
    local_media: LocalMedia,
    peers: tokio::sync::Mutex<HashMap<PeerId, NegotiationEngine>>,
    joined: AtomicBool,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ConnectionSupervisor {
    /// Connects to the rendezvous server named in `config` and captures the
    /// local media it asks for. Does not join yet.
    pub async fn connect(
        config: &ClientConfig,
        factory: Arc<dyn MediaEngineFactory>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        let url = config.websocket_url()?;
        let (socket, socket_events) =
            SignalingSocket::connect(&url, config.keepalive_interval).await?;
        let local_media = LocalMedia::from_constraints(&config.media);
        Ok(Self::with_socket(socket, socket_events, factory, local_media))
    }

    /// Builds a supervisor around an existing socket.
    pub fn with_socket(
        socket: SignalingSocket,
        socket_events: mpsc::UnboundedReceiver<SocketEvent>,
        factory: Arc<dyn MediaEngineFactory>,
        local_media: LocalMedia,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SupervisorInner {
            socket,
            factory,
            local_media,
            peers: tokio::sync::Mutex::new(HashMap::new()),
            joined: AtomicBool::new(false),
            events: events_tx,
        });
        let pump = tokio::spawn(pump(Arc::clone(&inner), socket_events));
        let supervisor = Self {
            inner,
            pump: Mutex::new(Some(pump)),
        };
        (supervisor, events_rx)
    }

    /// Announces this peer. Every peer already present is introduced through
    /// a greet, which opens one connection per peer.
    pub fn join(&self) -> Result<(), ClientError> {
        self.inner.joined.store(true, Ordering::Release);
        if let Err(err) = self.inner.socket.join() {
            self.inner.joined.store(false, Ordering::Release);
            return Err(err);
        }
        tracing::info!(target: TARGET, "joined");
        Ok(())
    }

    /// Announces departure and closes every connection. Safe to call more
    /// than once and after the transport is gone.
    pub async fn leave(&self) {
        let was_joined = self.inner.joined.swap(false, Ordering::AcqRel);
        if was_joined {
            if let Err(err) = self.inner.socket.leave() {
                tracing::debug!(target: TARGET, error = %err, "leave not sent");
            }
        }
        let closed = self.inner.close_all().await;
        if was_joined || closed > 0 {
            tracing::info!(target: TARGET, connections = closed, "left");
        }
    }

    /// Leaves and shuts the signaling transport down.
    pub async fn shutdown(&self) {
        self.leave().await;
        self.inner.socket.close();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    /// Flips the enabled flag of the local audio track. Does not renegotiate.
    /// Engines that produce media read the flag; [`crate::rtc::RtcMediaEngine`]
    /// sends no samples at all, so there it only changes what is reported.
    pub fn set_mic(&self, on: bool) -> bool {
        self.inner.local_media.set_enabled(TrackKind::Audio, on)
    }

    /// Flips the enabled flag of the local video track. Same caveat as
    /// [`Self::set_mic`].
    pub fn set_camera(&self, on: bool) -> bool {
        self.inner.local_media.set_enabled(TrackKind::Video, on)
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.inner.local_media
    }

    pub fn is_joined(&self) -> bool {
        self.inner.joined.load(Ordering::Acquire)
    }

    pub async fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.inner.peers.lock().await.keys().copied().collect();
        peers.sort();
        peers
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump(inner: Arc<SupervisorInner>, mut socket_events: mpsc::UnboundedReceiver<SocketEvent>) {
    while let Some(event) = socket_events.recv().await {
        match event {
            SocketEvent::Greeted(introduction) => inner.open(introduction).await,
            SocketEvent::Left(peer) => inner.on_left(peer).await,
            SocketEvent::Closed => {
                inner.joined.store(false, Ordering::Release);
                let closed = inner.close_all().await;
                tracing::info!(target: TARGET, connections = closed, "signaling closed");
                let _ = inner.events.send(SessionEvent::SignalingClosed);
                break;
            }
        }
    }
}

impl SupervisorInner {
    async fn open(&self, introduction: Introduction) {
        let Introduction {
            peer,
            registration,
            polite,
            channel,
            signals,
        } = introduction;
        let mut peers = self.peers.lock().await;
        if registration != self.socket.registration() {
            // Queued before a leave; the rejoin brings its own greet.
            tracing::debug!(target: TARGET, peer = %peer, registration, "stale greet ignored");
            return;
        }
        if !self.joined.load(Ordering::Acquire) {
            tracing::debug!(target: TARGET, peer = %peer, "greet after leave ignored");
            self.socket.forget_registered(peer, registration);
            return;
        }

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let media = match self.factory.create(peer, media_tx).await {
            Ok(media) => media,
            Err(err) => {
                self.socket.forget_registered(peer, registration);
                self.fail(peer, NegotiationError::Setup(err));
                return;
            }
        };
        let role = Role::from_polite(polite);
        let engine =
            NegotiationEngine::spawn(role, Arc::clone(&media), channel, signals, media_rx, self.events.clone());
        tracing::info!(target: TARGET, peer = %peer, ?role, "connection opened");
        let _ = self
            .events
            .send(SessionEvent::RemoteConnected { peer, polite });

        for track in self.local_media.tracks() {
            if let Err(source) = media.add_track(track).await {
                self.fail(
                    peer,
                    NegotiationError::AttachTrack {
                        track: track.id().to_string(),
                        source,
                    },
                );
            }
        }

        if let Some(stale) = peers.insert(peer, engine) {
            stale.close().await;
        }
    }

    async fn on_left(&self, peer: PeerId) {
        let engine = self.peers.lock().await.remove(&peer);
        if let Some(engine) = engine {
            engine.close().await;
            tracing::info!(target: TARGET, peer = %peer, "connection closed by remote leave");
            let _ = self.events.send(SessionEvent::RemoteDisconnected { peer });
        }
    }

    async fn close_all(&self) -> usize {
        let engines: Vec<_> = self.peers.lock().await.drain().collect();
        let count = engines.len();
        for (peer, engine) in engines {
            self.socket.forget(peer);
            engine.close().await;
        }
        count
    }

    fn fail(&self, peer: PeerId, error: NegotiationError) {
        tracing::warn!(target: TARGET, peer = %peer, error = %error, "connection setup failed");
        let _ = self
            .events
            .send(SessionEvent::NegotiationFailed { peer, error });
    }
}
