pub mod cli;
pub mod config;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;

pub use config::RelayConfig;
pub use registry::{CollisionPolicy, ConnectionHandle, ConnectionId, Registry};
pub use relay::{Dispatch, RelayError, RelayState};
