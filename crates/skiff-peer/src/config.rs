use std::path::PathBuf;
use std::time::Duration;

use skiff_proto::SessionId;

use crate::engine::{MediaConstraints, WebRtcEngineFactory};
use crate::identity::{resolve_identity, IdentityError};
use crate::negotiation::{NegotiationConfig, DEFAULT_NEGOTIATION_TIMEOUT};

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:3001";

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub relay_url: String,
    pub id: Option<SessionId>,
    pub id_file: Option<PathBuf>,
    pub ice_servers: Vec<String>,
    pub negotiation: NegotiationConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            id: None,
            id_file: None,
            ice_servers: Vec::new(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation.timeout = if timeout.is_zero() {
            DEFAULT_NEGOTIATION_TIMEOUT
        } else {
            timeout
        };
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.negotiation.constraints = constraints;
        self
    }

    pub fn identity(&self) -> Result<SessionId, IdentityError> {
        resolve_identity(self.id.clone(), self.id_file.as_deref())
    }

    pub fn engine_factory(&self) -> WebRtcEngineFactory {
        WebRtcEngineFactory::new(self.ice_servers.clone())
    }
}

/// Splits a comma separated server list, skipping empty entries.
pub fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|server| !server.is_empty())
        .map(str::to_owned)
        .collect()
}
