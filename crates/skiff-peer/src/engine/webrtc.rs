//! [`TransportEngine`] backed by webrtc-rs.
//!
//! Descriptions travel as `{"type": "...", "sdp": "..."}` and candidates as
//! `RTCIceCandidateInit` JSON, the same shapes a browser peer produces, so a
//! skiff endpoint can talk to one through the relay.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    Candidate, CandidateHandler, Connectivity, ConnectivityHandler, EngineError, EngineFactory,
    MediaConstraints, MediaHandle, RemoteTrack, Role, SessionDescription, TrackHandler,
    TransportEngine,
};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    stream_id: String,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

impl WebRtcEngine {
    pub async fn new(ice_servers: &[String]) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| EngineError::Fatal(format!("failed to register codecs: {err}")))?;
        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|err| {
                EngineError::Fatal(format!("failed to register interceptors: {err}"))
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|err| EngineError::Fatal(format!("failed to create peer connection: {err}")))?;

        Ok(Self {
            peer_connection: Arc::new(peer_connection),
            stream_id: format!("skiff-{}", uuid::Uuid::new_v4()),
            local_tracks: Mutex::new(Vec::new()),
        })
    }

    async fn add_local_track(
        &self,
        mime_type: &str,
        kind: &str,
    ) -> Result<String, EngineError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            kind.to_owned(),
            self.stream_id.clone(),
        ));
        self.peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| EngineError::Fatal(format!("failed to add {kind} track: {err}")))?;
        let id = track.id().to_owned();
        self.local_tracks.lock().push(track);
        Ok(id)
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, EngineError> {
        let mut track_ids = Vec::new();
        if constraints.audio {
            track_ids.push(self.add_local_track(MIME_TYPE_OPUS, "audio").await?);
        }
        if constraints.video {
            track_ids.push(self.add_local_track(MIME_TYPE_VP8, "video").await?);
        }
        debug!(target = "skiff::engine", tracks = ?track_ids, "local media attached");
        Ok(MediaHandle { track_ids })
    }

    async fn create_local_description(
        &self,
        role: Role,
    ) -> Result<SessionDescription, EngineError> {
        let description = match role {
            Role::Caller => self.peer_connection.create_offer(None).await,
            Role::Callee => self.peer_connection.create_answer(None).await,
        }
        .map_err(|err| EngineError::Fatal(format!("failed to create {role} description: {err}")))?;
        self.peer_connection
            .set_local_description(description.clone())
            .await
            .map_err(|err| EngineError::Fatal(format!("failed to set local description: {err}")))?;
        serde_json::to_value(description)
            .map(SessionDescription)
            .map_err(|err| EngineError::Fatal(format!("failed to encode description: {err}")))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let description: RTCSessionDescription = serde_json::from_value(description.0)
            .map_err(|err| EngineError::Rejected(format!("invalid description: {err}")))?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::Rejected(format!("remote description refused: {err}")))
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), EngineError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate.0)
            .map_err(|err| EngineError::Rejected(format!("invalid candidate: {err}")))?;
        self.peer_connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|err| EngineError::Rejected(format!("candidate refused: {err}")))
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering.
                if let Some(candidate) = candidate {
                    match encode_candidate(&candidate) {
                        Ok(value) => handler(Candidate(value)),
                        Err(err) => warn!(
                            target = "skiff::engine",
                            error = %err,
                            "failed to encode local candidate"
                        ),
                    }
                }
                Box::pin(async {})
            }));
    }

    fn on_remote_track(&self, handler: TrackHandler) {
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                handler(RemoteTrack {
                    id: track.id(),
                    kind: track.kind().to_string(),
                    stream_id: track.stream_id(),
                });
                Box::pin(async {})
            },
        ));
    }

    fn on_connectivity(&self, handler: ConnectivityHandler) {
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let connectivity = match state {
                    RTCPeerConnectionState::Connecting => Some(Connectivity::Connecting),
                    RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
                    RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
                    RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
                    RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
                    _ => None,
                };
                if let Some(connectivity) = connectivity {
                    handler(connectivity);
                }
                Box::pin(async {})
            }));
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.local_tracks.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|err| EngineError::Fatal(format!("failed to close peer connection: {err}")))
    }
}

fn encode_candidate(candidate: &RTCIceCandidate) -> Result<serde_json::Value, String> {
    let init = candidate.to_json().map_err(|err| err.to_string())?;
    serde_json::to_value(init).map_err(|err| err.to_string())
}

pub struct WebRtcEngineFactory {
    ice_servers: Vec<String>,
}

impl WebRtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        let ice_servers = if ice_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_owned()]
        } else {
            ice_servers
        };
        Self { ice_servers }
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self) -> Result<Arc<dyn TransportEngine>, EngineError> {
        Ok(Arc::new(WebRtcEngine::new(&self.ice_servers).await?))
    }
}
