use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tandem_client::config::{DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_STUN_SERVER};
use tandem_client::rtc::RtcEngineFactory;
use tandem_client::{ClientConfig, ConnectionSupervisor, MediaConstraints, SessionEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "tandem-peer")]
#[command(about = "Join a tandem room and negotiate with every other peer in it")]
struct Cli {
    /// Rendezvous server address (http, https, ws or wss)
    #[arg(long, env = "TANDEM_SIGNALING_URL", default_value = "http://127.0.0.1:8443")]
    signaling_url: Url,

    /// ICE server URL; repeat to add more
    #[arg(long = "ice-server", env = "TANDEM_ICE_SERVERS", value_delimiter = ',', default_value = DEFAULT_STUN_SERVER)]
    ice_servers: Vec<String>,

    /// Seconds between keepalive pings
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_INTERVAL.as_secs())]
    keepalive_secs: u64,

    /// Do not offer an audio track
    #[arg(long)]
    no_audio: bool,

    /// Do not offer a video track
    #[arg(long)]
    no_video: bool,

    /// Start with the microphone muted
    #[arg(long)]
    muted: bool,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        let defaults = MediaConstraints::default();
        let mut config = ClientConfig::new(self.signaling_url.clone());
        config.ice_servers = self.ice_servers.clone();
        config.keepalive_interval = Duration::from_secs(self.keepalive_secs.max(1));
        config.media = MediaConstraints {
            audio: !self.no_audio,
            video: if self.no_video { None } else { defaults.video },
        };
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.client_config();
    info!(
        signaling_url = %config.signaling_url,
        ice_servers = ?config.ice_servers,
        audio = config.media.audio,
        video = config.media.video.is_some(),
        "starting tandem peer"
    );

    let factory = RtcEngineFactory::new(config.ice_servers.clone())
        .context("failed to set up the webrtc stack")?;
    let (supervisor, events) = ConnectionSupervisor::connect(&config, Arc::new(factory))
        .await
        .context("failed to reach the rendezvous server")?;
    if cli.muted {
        supervisor.set_mic(false);
    }
    supervisor.join().context("failed to join")?;

    let signaling_lost = tokio::select! {
        lost = log_events(events) => lost,
        _ = tokio::signal::ctrl_c() => false,
    };

    info!(peers = supervisor.active_peers().await.len(), "leaving");
    supervisor.shutdown().await;
    if signaling_lost {
        anyhow::bail!("signaling connection lost");
    }
    Ok(())
}

/// Logs session events until the signaling transport goes away. Returns
/// whether it did.
async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::RemoteConnected { peer, polite } => {
                info!(peer = %peer, polite, "peer connected")
            }
            SessionEvent::RemoteDisconnected { peer } => info!(peer = %peer, "peer left"),
            SessionEvent::RemoteTrack { peer, track } => info!(
                peer = %peer,
                kind = %track.kind,
                track_id = %track.track_id,
                "receiving remote track"
            ),
            SessionEvent::NegotiationFailed { peer, error } => {
                warn!(peer = %peer, error = %error, "negotiation step failed")
            }
            SessionEvent::SignalingClosed => {
                warn!("signaling connection closed");
                return true;
            }
        }
    }
    true
}
