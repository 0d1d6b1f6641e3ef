//! Endpoint side of skiff.
//!
//! A [`SignalingClient`] connects to the relay, an [`Endpoint`] turns the
//! envelopes it receives into [`NegotiationSession`] operations, and each
//! session drives one [`TransportEngine`].

pub mod config;
pub mod endpoint;
pub mod engine;
pub mod identity;
pub mod negotiation;
pub mod signaling;

pub use config::PeerConfig;
pub use endpoint::{Command, Endpoint, EndpointEvent};
pub use engine::{
    Candidate, Connectivity, EngineError, EngineFactory, MediaConstraints, RemoteTrack, Role,
    SessionDescription, TransportEngine,
};
pub use identity::{load_or_create_identity, IdentityError};
pub use negotiation::{
    NegotiationConfig, NegotiationError, NegotiationSession, NegotiationState, Outcome,
    SessionEvent, SessionHandle,
};
pub use signaling::{SignalingClient, SignalingError};
