use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ClientError;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SOCKET_PATH: &str = "/ws";

/// Settings for one peer session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rendezvous server address. `http`/`https` are accepted and mapped to
    /// the matching websocket scheme.
    pub signaling_url: Url,
    pub ice_servers: Vec<String>,
    pub keepalive_interval: Duration,
    pub media: MediaConstraints,
}

impl ClientConfig {
    pub fn new(signaling_url: Url) -> Self {
        Self {
            signaling_url,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            media: MediaConstraints::default(),
        }
    }

    pub fn parse(signaling_url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(signaling_url).map_err(|err| ClientError::InvalidUrl {
            url: signaling_url.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self::new(url))
    }

    pub fn websocket_url(&self) -> Result<Url, ClientError> {
        derive_websocket_url(&self.signaling_url)
    }
}

/// What to capture locally. Mirrors the capture request a browser would make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub facing_mode: String,
    pub frame_rate: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            facing_mode: "user".to_string(),
            frame_rate: 15,
            width: 320,
            height: 240,
        }
    }
}

fn derive_websocket_url(base: &Url) -> Result<Url, ClientError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ClientError::InvalidUrl {
                url: base.to_string(),
                reason: format!("unsupported scheme {other}"),
            })
        }
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme).map_err(|_| ClientError::InvalidUrl {
        url: base.to_string(),
        reason: "invalid websocket scheme".into(),
    })?;
    if ws.path().is_empty() || ws.path() == "/" {
        ws.set_path(DEFAULT_SOCKET_PATH);
    }
    ws.set_fragment(None);
    Ok(ws)
}
