use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use skiff_peer::config::{parse_ice_servers, DEFAULT_RELAY_URL};
use skiff_peer::{MediaConstraints, PeerConfig};
use skiff_proto::SessionId;

#[derive(Parser, Debug)]
#[command(
    name = "skiff",
    about = "Negotiate a peer-to-peer media call through a skiff relay",
    version
)]
pub struct Cli {
    /// Relay WebSocket URL
    #[arg(long, env = "SKIFF_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    /// Session id to register under; generated when absent
    #[arg(long, env = "SKIFF_ID")]
    pub id: Option<String>,

    /// File that keeps the generated session id between runs
    #[arg(long, env = "SKIFF_ID_FILE")]
    pub id_file: Option<PathBuf>,

    /// Seconds an offer may stay unanswered before the call fails
    #[arg(long, env = "SKIFF_NEGOTIATION_TIMEOUT_SECS", default_value_t = 30)]
    pub negotiation_timeout_secs: u64,

    /// Comma separated STUN/TURN urls
    #[arg(long, env = "SKIFF_ICE_SERVERS")]
    pub ice_servers: Option<String>,

    #[arg(long)]
    pub no_audio: bool,

    #[arg(long)]
    pub no_video: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Call a peer by session id and exit when the call ends
    Call { peer: String },
    /// Register and answer incoming calls until interrupted
    Listen,
}

impl Cli {
    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            relay_url: self.relay_url.clone(),
            id: self.id.as_deref().map(SessionId::from),
            id_file: self.id_file.clone(),
            ice_servers: self
                .ice_servers
                .as_deref()
                .map(parse_ice_servers)
                .unwrap_or_default(),
            ..PeerConfig::default()
        }
        .with_timeout(Duration::from_secs(self.negotiation_timeout_secs))
        .with_constraints(MediaConstraints {
            audio: !self.no_audio,
            video: !self.no_video,
        })
    }

    pub fn call_target(&self) -> Option<SessionId> {
        match &self.command {
            Commands::Call { peer } => Some(SessionId::from(peer.as_str())),
            Commands::Listen => None,
        }
    }
}
