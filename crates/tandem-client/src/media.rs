//! The media capability a [`crate::NegotiationEngine`] drives.
//!
//! Real peers use [`crate::rtc::RtcEngineFactory`]; tests use
//! [`crate::mock::MockEngineFactory`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tandem_proto::payload::{IceCandidate, SessionDescription};
use tandem_proto::PeerId;
use tokio::sync::mpsc;

use crate::config::MediaConstraints;
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    pub fn is_stable(self) -> bool {
        matches!(self, SignalingState::Stable)
    }
}

/// Argument to [`MediaEngine::set_local_description`].
#[derive(Debug, Clone, PartialEq)]
pub enum LocalDescription {
    Description(SessionDescription),
    /// Abandon a pending offer and return to the last stable state.
    /// Applying it while already stable is a no-op.
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A locally captured track. Clones share the enabled flag, so muting on one
/// handle mutes every connection the track is attached to.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// The local capture, acquired once per session and shared by every peer
/// connection.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn from_constraints(constraints: &MediaConstraints) -> Self {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new("tandem-audio", TrackKind::Audio));
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new("tandem-video", TrackKind::Video));
        }
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Flips the enabled flag on every track of `kind`. Returns whether any
    /// track of that kind exists.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|track| track.kind == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        found
    }

    pub fn is_enabled(&self, kind: TrackKind) -> Option<bool> {
        self.tracks
            .iter()
            .find(|track| track.kind == kind)
            .map(LocalTrack::is_enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Notifications a media engine raises on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    NegotiationNeeded,
    /// `None` marks end of candidates.
    LocalIceCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrack),
}

pub type MediaEventSender = mpsc::UnboundedSender<MediaEvent>;

/// One peer connection's media stack.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: LocalDescription)
        -> Result<(), MediaError>;

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), MediaError>;

    /// `None` signals end of candidates.
    async fn add_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<(), MediaError>;

    fn signaling_state(&self) -> SignalingState;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError>;

    async fn close(&self);
}

/// Builds one [`MediaEngine`] per remote peer. The engine reports its
/// [`MediaEvent`]s through `events` for as long as it lives.
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn create(
        &self,
        peer: PeerId,
        events: MediaEventSender,
    ) -> Result<Arc<dyn MediaEngine>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConstraints;

    #[test_timeout::timeout]
    fn constraints_decide_tracks() {
        let media = LocalMedia::from_constraints(&MediaConstraints {
            audio: true,
            video: None,
        });
        assert_eq!(media.tracks().len(), 1);
        assert_eq!(media.tracks()[0].kind(), TrackKind::Audio);

        let media = LocalMedia::from_constraints(&MediaConstraints {
            audio: false,
            video: Some(VideoConstraints::default()),
        });
        assert_eq!(media.tracks().len(), 1);
        assert_eq!(media.tracks()[0].kind(), TrackKind::Video);
    }

    #[test_timeout::timeout]
    fn toggling_is_shared_between_clones() {
        let media = LocalMedia::from_constraints(&MediaConstraints::default());
        let attached = media.tracks()[1].clone();
        assert!(attached.is_enabled());

        assert!(media.set_enabled(TrackKind::Video, false));
        assert!(!attached.is_enabled());
        assert_eq!(media.is_enabled(TrackKind::Audio), Some(true));

        let silent = LocalMedia::default();
        assert!(!silent.set_enabled(TrackKind::Audio, false));
        assert_eq!(silent.is_enabled(TrackKind::Audio), None);
    }
}
