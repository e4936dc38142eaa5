//! Per-connection perfect negotiation.
//!
//! Every state-changing call on the [`MediaEngine`] goes through one
//! operations lock, so at most one offer/answer step runs at a time and a
//! rollback and the remote description it makes room for are applied as one
//! step. Remote signals are handled strictly in arrival order; locally
//! triggered offers run as separate tasks that contend for the same lock.

mod phase;

pub use phase::{Directive, Phase, PhaseEvent, Role};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_proto::payload::{IceCandidate, SessionDescription};
use tandem_proto::PeerId;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::error::NegotiationError;
use crate::media::{LocalDescription, MediaEngine, MediaEvent};
use crate::signaling::{RemoteSignal, SignalingChannel};
use crate::supervisor::SessionEvent;

const TARGET: &str = "tandem::negotiation";

/// Drives one peer connection.
pub struct NegotiationEngine {
    shared: Arc<EngineShared>,
    driver: JoinHandle<()>,
    closed: AtomicBool,
}

struct EngineShared {
    peer: PeerId,
    role: Role,
    media: Arc<dyn MediaEngine>,
    channel: SignalingChannel,
    phase: Mutex<Phase>,
    operations: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl NegotiationEngine {
    /// Starts the driver task. It runs until `signals` or `media_events`
    /// ends, or until [`Self::close`].
    pub fn spawn(
        role: Role,
        media: Arc<dyn MediaEngine>,
        channel: SignalingChannel,
        signals: mpsc::UnboundedReceiver<RemoteSignal>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            peer: channel.remote_peer_id(),
            role,
            media,
            channel,
            phase: Mutex::new(Phase::Idle),
            operations: tokio::sync::Mutex::new(()),
            events,
        });
        let driver = tokio::spawn(drive(Arc::clone(&shared), signals, media_events));
        Self {
            shared,
            driver,
            closed: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn phase(&self) -> Phase {
        *self.shared.phase.lock()
    }

    /// Stops negotiating and closes the media engine. Safe mid-negotiation
    /// and safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.driver.abort();
        self.shared.media.close().await;
        tracing::debug!(target: TARGET, peer = %self.shared.peer, "connection closed");
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(
    shared: Arc<EngineShared>,
    mut signals: mpsc::UnboundedReceiver<RemoteSignal>,
    mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
) {
    let mut offers = JoinSet::new();
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(signal) => shared.handle_remote(signal).await,
                None => break,
            },
            event = media_events.recv() => match event {
                Some(MediaEvent::NegotiationNeeded) => {
                    let settle = shared.begin_offer();
                    let shared = Arc::clone(&shared);
                    offers.spawn(async move { shared.negotiate(settle).await });
                }
                Some(MediaEvent::LocalIceCandidate(candidate)) => {
                    if let Err(err) = shared.channel.send_ice_candidate(candidate.as_ref()) {
                        tracing::debug!(target: TARGET, peer = %shared.peer, error = %err, "local candidate not sent");
                    }
                }
                Some(MediaEvent::RemoteTrack(track)) => {
                    tracing::debug!(target: TARGET, peer = %shared.peer, track = %track.track_id, kind = %track.kind, "remote track");
                    let _ = shared.events.send(SessionEvent::RemoteTrack { peer: shared.peer, track });
                }
                None => break,
            },
            Some(joined) = offers.join_next(), if !offers.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        tracing::warn!(target: TARGET, peer = %shared.peer, "offer task panicked");
                    }
                }
            }
        }
    }
    tracing::trace!(target: TARGET, peer = %shared.peer, "driver stopped");
}

/// Clears the making-offer flag when an offer attempt ends, however it ends.
struct OfferSettle {
    shared: Arc<EngineShared>,
}

impl Drop for OfferSettle {
    fn drop(&mut self) {
        self.shared.advance(PhaseEvent::OfferSettled);
    }
}

impl EngineShared {
    fn advance(&self, event: PhaseEvent) -> Directive {
        let mut phase = self.phase.lock();
        let (next, directive) = phase.transition(self.role, event);
        if next != *phase {
            tracing::trace!(target: TARGET, peer = %self.peer, from = ?*phase, to = ?next, "phase");
        }
        *phase = next;
        directive
    }

    fn begin_offer(self: &Arc<Self>) -> OfferSettle {
        self.advance(PhaseEvent::OfferStarted);
        OfferSettle {
            shared: Arc::clone(self),
        }
    }

    async fn negotiate(&self, settle: OfferSettle) {
        match self.offer().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(target: TARGET, peer = %self.peer, "offer abandoned; negotiation already in progress")
            }
            Err(err) => self.report(err),
        }
        drop(settle);
    }

    /// Returns `false` when the attempt was abandoned because the connection
    /// was not stable once the lock was held.
    async fn offer(&self) -> Result<bool, NegotiationError> {
        let offer = {
            let _operations = self.operations.lock().await;
            if !self.media.signaling_state().is_stable() {
                return Ok(false);
            }
            let offer = self
                .media
                .create_offer()
                .await
                .map_err(NegotiationError::CreateOffer)?;
            self.set_local(offer).await?
        };
        tracing::debug!(target: TARGET, peer = %self.peer, "sending offer");
        self.channel.send_description(&offer)?;
        Ok(true)
    }

    async fn set_local(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let kind = description.kind;
        self.media
            .set_local_description(LocalDescription::Description(description.clone()))
            .await
            .map_err(|source| NegotiationError::SetLocal { kind, source })?;
        Ok(description)
    }

    async fn handle_remote(&self, signal: RemoteSignal) {
        let result = match signal {
            RemoteSignal::Description(value) => match SessionDescription::from_value(value) {
                Ok(description) => self.on_remote_description(description).await,
                Err(err) => Err(err.into()),
            },
            RemoteSignal::IceCandidate(value) => {
                match value.map(IceCandidate::from_value).transpose() {
                    Ok(candidate) => self.on_remote_candidate(candidate).await,
                    Err(err) => Err(err.into()),
                }
            }
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    async fn on_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let is_offer = description.is_offer();
        let stable = self.media.signaling_state().is_stable();
        let directive = self.advance(PhaseEvent::RemoteDescription { is_offer, stable });

        let _operations = match directive {
            Directive::Ignore => {
                tracing::debug!(target: TARGET, peer = %self.peer, "ignoring colliding offer");
                return Ok(());
            }
            Directive::RollbackAndApply => {
                tracing::debug!(target: TARGET, peer = %self.peer, "yielding to colliding offer");
                let operations = self.operations.lock().await;
                let applied = self.rollback_and_apply(description).await;
                self.advance(PhaseEvent::YieldSettled);
                applied?;
                operations
            }
            Directive::Apply | Directive::Continue => {
                let operations = self.operations.lock().await;
                self.apply_remote(description).await?;
                operations
            }
        };

        if is_offer {
            let answer = self
                .media
                .create_answer()
                .await
                .map_err(NegotiationError::CreateAnswer)?;
            let answer = self.set_local(answer).await?;
            tracing::debug!(target: TARGET, peer = %self.peer, "sending answer");
            self.channel.send_description(&answer)?;
        }
        Ok(())
    }

    async fn rollback_and_apply(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.media
            .set_local_description(LocalDescription::Rollback)
            .await
            .map_err(NegotiationError::Rollback)?;
        self.apply_remote(description).await
    }

    async fn apply_remote(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        let kind = description.kind;
        self.media
            .set_remote_description(description)
            .await
            .map_err(|source| NegotiationError::SetRemote { kind, source })
    }

    async fn on_remote_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        let added = {
            let _operations = self.operations.lock().await;
            self.media.add_ice_candidate(candidate).await
        };
        match added {
            Ok(()) => Ok(()),
            Err(err) if self.phase.lock().ignore_offer() => {
                tracing::debug!(target: TARGET, peer = %self.peer, error = %err, "candidate for ignored offer dropped");
                Ok(())
            }
            Err(err) => Err(NegotiationError::AddIceCandidate(err)),
        }
    }

    fn report(&self, error: NegotiationError) {
        tracing::warn!(target: TARGET, peer = %self.peer, error = %error, "negotiation step failed");
        let _ = self.events.send(SessionEvent::NegotiationFailed {
            peer: self.peer,
            error,
        });
    }
}
