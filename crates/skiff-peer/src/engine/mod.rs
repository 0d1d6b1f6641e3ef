//! The media/connectivity engine a negotiation drives.
//!
//! The negotiation layer never looks inside descriptions or candidates; it
//! only moves them between the signaling channel and an engine. Engines report
//! back through the handlers registered on them, which a [`SessionHandle`]
//! builds so every callback is tagged with the session that owns the engine.
//!
//! [`SessionHandle`]: crate::negotiation::SessionHandle

pub mod mock;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use self::mock::{EngineCall, MockEngine, MockEngineFactory, MockScript};
pub use self::webrtc::{WebRtcEngine, WebRtcEngineFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Callee => f.write_str("callee"),
        }
    }
}

/// An offer or answer, carried verbatim as the envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub Value);

impl SessionDescription {
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// A connectivity candidate, carried verbatim as the envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(pub Value);

impl Candidate {
    pub fn into_value(self) -> Value {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// What `acquire_local_media` attached to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaHandle {
    pub track_ids: Vec<String>,
}

/// An inbound media track announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused one input; the negotiation may carry on.
    #[error("engine rejected input: {0}")]
    Rejected(String),
    /// The engine cannot continue this negotiation.
    #[error("engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

pub type CandidateHandler = Box<dyn Fn(Candidate) + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;
pub type ConnectivityHandler = Box<dyn Fn(Connectivity) + Send + Sync>;

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, EngineError>;

    /// Creates an offer (caller) or answer (callee) and applies it locally.
    async fn create_local_description(
        &self,
        role: Role,
    ) -> Result<SessionDescription, EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), EngineError>;

    fn on_local_candidate(&self, handler: CandidateHandler);

    fn on_remote_track(&self, handler: TrackHandler);

    fn on_connectivity(&self, handler: ConnectivityHandler);

    async fn close(&self) -> Result<(), EngineError>;
}

/// Builds one engine per negotiation attempt.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn TransportEngine>, EngineError>;
}
