use tandem_proto::payload::SdpType;
use thiserror::Error;

/// Failure reported by a [`crate::MediaEngine`] implementation.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MediaError(String);

impl MediaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("signaling transport closed")]
    TransportClosed,
}

/// A per-connection negotiation failure. Never fatal: the pair stays up and
/// the next negotiation-needed trigger retries.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("media engine setup failed: {0}")]
    Setup(MediaError),
    #[error("attaching local track {track} failed: {source}")]
    AttachTrack {
        track: String,
        #[source]
        source: MediaError,
    },
    #[error("creating offer failed: {0}")]
    CreateOffer(MediaError),
    #[error("creating answer failed: {0}")]
    CreateAnswer(MediaError),
    #[error("applying local {kind} failed: {source}")]
    SetLocal {
        kind: SdpType,
        #[source]
        source: MediaError,
    },
    #[error("applying remote {kind} failed: {source}")]
    SetRemote {
        kind: SdpType,
        #[source]
        source: MediaError,
    },
    #[error("rollback failed: {0}")]
    Rollback(MediaError),
    #[error("adding remote ice candidate failed: {0}")]
    AddIceCandidate(MediaError),
    #[error("undecodable remote payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("signaling channel closed")]
    ChannelClosed,
}
