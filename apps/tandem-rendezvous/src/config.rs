use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub static_dir: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "tandem-rendezvous",
    author,
    version,
    about = "Introduces tandem peers to each other and relays their negotiation messages"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "TANDEM_LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    pub listen_addr: String,

    /// Directory served at `/` next to the signaling endpoint.
    #[arg(long, env = "TANDEM_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TANDEM_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if let Some(dir) = &cli.static_dir {
            anyhow::ensure!(dir.is_dir(), "static dir {} is not a directory", dir.display());
        }
        Ok(ServerConfig {
            listen_addr,
            static_dir: cli.static_dir,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
