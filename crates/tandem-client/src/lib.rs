//! Peer side of tandem.
//!
//! A [`ConnectionSupervisor`] owns the local tracks and one
//! [`NegotiationEngine`] per introduced remote peer. Each engine talks to its
//! peer through a [`SignalingChannel`] carved out of the single
//! [`SignalingSocket`] and drives a [`MediaEngine`] with the "perfect
//! negotiation" rules: the polite side always yields on an offer collision,
//! the impolite side always keeps its own offer.

pub mod config;
pub mod error;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod rtc;
pub mod signaling;
pub mod supervisor;

pub use config::{ClientConfig, MediaConstraints, VideoConstraints};
pub use error::{ClientError, MediaError, NegotiationError};
pub use media::{
    LocalDescription, LocalMedia, LocalTrack, MediaEngine, MediaEngineFactory, MediaEvent,
    MediaEventSender, RemoteTrack, SignalingState, TrackKind,
};
pub use negotiation::{NegotiationEngine, Phase, Role};
pub use signaling::{Introduction, RemoteSignal, SignalingChannel, SignalingSocket, SocketEvent};
pub use supervisor::{ConnectionSupervisor, SessionEvent};
pub use tandem_proto::payload::{IceCandidate, SdpType, SessionDescription};
pub use tandem_proto::PeerId;
