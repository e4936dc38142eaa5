//! [`MediaEngine`] backed by a `webrtc` peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_proto::payload::{IceCandidate, SdpType, SessionDescription};
use tandem_proto::PeerId;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaError;
use crate::media::{
    LocalDescription, LocalTrack, MediaEngine, MediaEngineFactory, MediaEvent, MediaEventSender,
    RemoteTrack, SignalingState, TrackKind,
};

const TARGET: &str = "tandem::negotiation";

fn media_error(err: webrtc::Error) -> MediaError {
    MediaError::new(err.to_string())
}

/// Creates one `RTCPeerConnection` per remote peer from a shared API
/// instance with the default codecs and interceptors.
pub struct RtcEngineFactory {
    api: API,
    ice_servers: Vec<String>,
    stream_id: String,
}

impl RtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, MediaError> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(media_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(media_error)?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            stream_id: "tandem".to_string(),
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        peer: PeerId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(media_error)?,
        );
        install_handlers(&pc, events);
        tracing::debug!(target: TARGET, peer = %peer, "peer connection created");
        Ok(Arc::new(RtcMediaEngine {
            pc,
            stream_id: self.stream_id.clone(),
        }))
    }
}

fn install_handlers(pc: &RTCPeerConnection, events: MediaEventSender) {
    let negotiation_tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = negotiation_tx.clone();
        Box::pin(async move {
            let _ = tx.send(MediaEvent::NegotiationNeeded);
        })
    }));

    let candidate_tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(err) => {
                        tracing::warn!(target: TARGET, error = %err, "failed to serialize local candidate");
                        return;
                    }
                },
                None => None,
            };
            let _ = tx.send(MediaEvent::LocalIceCandidate(candidate));
        })
    }));

    let track_tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let remote = RemoteTrack {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind: match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                },
            };
            let tx = track_tx.clone();
            Box::pin(async move {
                let _ = tx.send(MediaEvent::RemoteTrack(remote));
            })
        },
    ));
}

/// Negotiates real transports for the local tracks. Capture is out of
/// scope: the attached tracks carry no samples, so their enabled flags have
/// no effect on what is sent.
pub struct RtcMediaEngine {
    pc: Arc<RTCPeerConnection>,
    stream_id: String,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let SessionDescription { kind, sdp } = description;
    match kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => return Err(MediaError::new("rollback carries no sdp")),
    }
    .map_err(media_error)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MediaError::new("session description without type"))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

#[async_trait]
impl MediaEngine for RtcMediaEngine {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        from_rtc(self.pc.create_offer(None).await.map_err(media_error)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        from_rtc(self.pc.create_answer(None).await.map_err(media_error)?)
    }

    async fn set_local_description(
        &self,
        description: LocalDescription,
    ) -> Result<(), MediaError> {
        let description = match description {
            LocalDescription::Description(description) => to_rtc(description)?,
            LocalDescription::Rollback => {
                if self.signaling_state().is_stable() {
                    return Ok(());
                }
                let mut rollback = RTCSessionDescription::default();
                rollback.sdp_type = RTCSdpType::Rollback;
                rollback
            }
        };
        self.pc
            .set_local_description(description)
            .await
            .map_err(media_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(media_error)
    }

    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), MediaError> {
        // An empty candidate string marks end of candidates.
        let init = match candidate {
            Some(candidate) => RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            },
            None => RTCIceCandidateInit::default(),
        };
        self.pc.add_ice_candidate(init).await.map_err(media_error)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id().to_owned(),
            self.stream_id.clone(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(media_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: TARGET, error = %err, "peer connection close failed");
        }
    }
}
