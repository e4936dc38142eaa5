//! In-process [`MediaEngine`] that enforces the signaling-state legality rules
//! of a browser peer connection without touching any real media.
//!
//! Used by the negotiation tests and handy for exercising a rendezvous server
//! without codecs or ICE.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tandem_proto::payload::{IceCandidate, SdpType, SessionDescription};
use tandem_proto::PeerId;
use tokio::sync::Semaphore;

use crate::error::MediaError;
use crate::media::{
    LocalDescription, LocalTrack, MediaEngine, MediaEngineFactory, MediaEvent, MediaEventSender,
    RemoteTrack, SignalingState,
};

/// One state-changing call observed by a [`MockMediaEngine`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    SetLocal(SdpType),
    SetRemote(SdpType),
    Rollback,
    AddCandidate,
    AddTrack(String),
}

#[derive(Debug)]
struct MockState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    stable_remote: Option<SessionDescription>,
    offers_created: u32,
    answers_created: u32,
    negotiation_pending: bool,
    reject_candidates: bool,
    candidates: Vec<Option<IceCandidate>>,
    tracks: Vec<LocalTrack>,
    ops: Vec<MockOp>,
    closed: bool,
}

impl MockState {
    fn settle(&mut self) {
        self.signaling = SignalingState::Stable;
        self.stable_local = self.local.clone();
        self.stable_remote = self.remote.clone();
    }
}

pub struct MockMediaEngine {
    label: String,
    events: MediaEventSender,
    state: Mutex<MockState>,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockMediaEngine {
    pub fn new(label: impl Into<String>, events: MediaEventSender) -> Self {
        Self {
            label: label.into(),
            events,
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                stable_local: None,
                stable_remote: None,
                offers_created: 0,
                answers_created: 0,
                negotiation_pending: false,
                reject_candidates: false,
                candidates: Vec::new(),
                tracks: Vec::new(),
                ops: Vec::new(),
                closed: false,
            }),
            offer_gate: Mutex::new(None),
        }
    }

    /// Raises a negotiation-needed event as if the track set had changed.
    pub fn trigger_negotiation_needed(&self) {
        let _ = self.events.send(MediaEvent::NegotiationNeeded);
    }

    /// Raises a local ICE candidate event.
    pub fn emit_local_candidate(&self, candidate: Option<IceCandidate>) {
        let _ = self.events.send(MediaEvent::LocalIceCandidate(candidate));
    }

    pub fn emit_remote_track(&self, track: RemoteTrack) {
        let _ = self.events.send(MediaEvent::RemoteTrack(track));
    }

    /// Makes every subsequent `create_offer` wait for [`Self::release_offer`].
    pub fn hold_offers(&self) {
        *self.offer_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Lets one held `create_offer` call finish.
    pub fn release_offer(&self) {
        if let Some(gate) = self.offer_gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    pub fn reject_candidates(&self, reject: bool) {
        self.state.lock().reject_candidates = reject;
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers_created
    }

    pub fn answers_created(&self) -> u32 {
        self.state.lock().answers_created
    }

    pub fn applied_candidates(&self) -> Vec<Option<IceCandidate>> {
        self.state.lock().candidates.clone()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().ops.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn illegal(&self, what: &str, state: SignalingState) -> MediaError {
        MediaError::new(format!("{}: cannot {what} in state {state:?}", self.label))
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let gate = self.offer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| MediaError::new("offer gate closed"))?
                .forget();
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.illegal("create offer", SignalingState::Closed));
        }
        state.offers_created += 1;
        state.negotiation_pending = false;
        Ok(SessionDescription::offer(format!(
            "{}-offer-{}",
            self.label, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(self.illegal("create answer", state.signaling));
        }
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "{}-answer-{}",
            self.label, state.answers_created
        )))
    }

    async fn set_local_description(
        &self,
        description: LocalDescription,
    ) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        let description = match description {
            LocalDescription::Rollback => {
                match state.signaling {
                    SignalingState::Stable => {}
                    SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                        state.local = state.stable_local.clone();
                        state.remote = state.stable_remote.clone();
                        state.signaling = SignalingState::Stable;
                    }
                    other => return Err(self.illegal("roll back", other)),
                }
                state.ops.push(MockOp::Rollback);
                return Ok(());
            }
            LocalDescription::Description(description) => description,
        };
        let kind = description.kind;
        match (kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                state.signaling = SignalingState::HaveLocalOffer;
                state.local = Some(description);
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                state.local = Some(description);
                state.settle();
            }
            (kind, current) => return Err(self.illegal(&format!("set local {kind}"), current)),
        }
        state.ops.push(MockOp::SetLocal(kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        let kind = description.kind;
        match (kind, state.signaling) {
            (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                state.signaling = SignalingState::HaveRemoteOffer;
                state.remote = Some(description);
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                state.remote = Some(description);
                state.settle();
            }
            (kind, current) => return Err(self.illegal(&format!("set remote {kind}"), current)),
        }
        state.ops.push(MockOp::SetRemote(kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.reject_candidates {
            return Err(MediaError::new(format!(
                "{}: candidate rejected",
                self.label
            )));
        }
        if state.remote.is_none() {
            return Err(MediaError::new(format!(
                "{}: no remote description for candidate",
                self.label
            )));
        }
        state.candidates.push(candidate);
        state.ops.push(MockOp::AddCandidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling
        }
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let raise = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(self.illegal("add track", SignalingState::Closed));
            }
            state.tracks.push(track.clone());
            state.ops.push(MockOp::AddTrack(track.id().to_string()));
            !std::mem::replace(&mut state.negotiation_pending, true)
        };
        // Browsers coalesce back-to-back track additions into one event.
        if raise {
            let _ = self.events.send(MediaEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
    }
}

/// Hands out [`MockMediaEngine`]s and remembers them by peer so tests can
/// reach in afterwards.
#[derive(Default)]
pub struct MockEngineFactory {
    name: String,
    engines: Mutex<HashMap<PeerId, Arc<MockMediaEngine>>>,
    hold_offers: bool,
}

impl MockEngineFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Every engine created afterwards starts with held offers.
    pub fn holding_offers(mut self) -> Self {
        self.hold_offers = true;
        self
    }

    pub fn engine(&self, peer: PeerId) -> Option<Arc<MockMediaEngine>> {
        self.engines.lock().get(&peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.engines.lock().keys().copied().collect();
        peers.sort();
        peers
    }
}

#[async_trait]
impl MediaEngineFactory for MockEngineFactory {
    async fn create(
        &self,
        peer: PeerId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let engine = Arc::new(MockMediaEngine::new(
            format!("{}->{peer}", self.name),
            events,
        ));
        if self.hold_offers {
            engine.hold_offers();
        }
        self.engines.lock().insert(peer, Arc::clone(&engine));
        Ok(engine)
    }
}
