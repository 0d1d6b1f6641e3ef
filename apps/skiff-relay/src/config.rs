use std::net::SocketAddr;

use anyhow::{Context, Result};

use crate::cli::ServeArgs;
use crate::registry::CollisionPolicy;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3001";
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub collision_policy: CollisionPolicy,
    pub max_message_bytes: usize,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self> {
        let listen_addr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {}", args.listen_addr))?;
        anyhow::ensure!(
            args.max_message_bytes > 0,
            "max message size must be greater than zero"
        );
        Ok(Self {
            listen_addr,
            collision_policy: args.collision_policy,
            max_message_bytes: args.max_message_bytes,
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            collision_policy: CollisionPolicy::default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}
