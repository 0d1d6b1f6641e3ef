use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{
    Candidate, CandidateHandler, Connectivity, ConnectivityHandler, EngineError, EngineFactory,
    MediaConstraints, MediaHandle, RemoteTrack, Role, SessionDescription, TrackHandler,
    TransportEngine,
};

/// One call made into a [`MockEngine`], in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    AcquireMedia(MediaConstraints),
    CreateDescription(Role),
    SetRemoteDescription(SessionDescription),
    AddCandidate(Candidate),
    Close,
}

/// Failures a mock engine should produce.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// Candidates whose payload equals one of these are rejected.
    pub rejected_candidates: Vec<Value>,
    pub fail_media: bool,
    pub reject_remote_description: bool,
    /// Every `add_candidate` fails fatally.
    pub fatal_candidates: bool,
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    remote: Option<SessionDescription>,
    candidate_handler: Option<CandidateHandler>,
    track_handler: Option<TrackHandler>,
    connectivity_handler: Option<ConnectivityHandler>,
}

/// In-memory engine that records what the negotiation asked of it.
pub struct MockEngine {
    id: u64,
    script: MockScript,
    state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new(id: u64, script: MockScript) -> Self {
        Self {
            id,
            script,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.lock().calls.clone()
    }

    /// Candidates accepted or attempted, in the order they reached the engine.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .calls
            .iter()
            .any(|call| matches!(call, EngineCall::Close))
    }

    pub fn fire_local_candidate(&self, candidate: Candidate) {
        if let Some(handler) = self.state.lock().candidate_handler.as_ref() {
            handler(candidate);
        }
    }

    pub fn fire_remote_track(&self, track: RemoteTrack) {
        if let Some(handler) = self.state.lock().track_handler.as_ref() {
            handler(track);
        }
    }

    pub fn fire_connectivity(&self, connectivity: Connectivity) {
        if let Some(handler) = self.state.lock().connectivity_handler.as_ref() {
            handler(connectivity);
        }
    }

    fn record(&self, call: EngineCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, EngineError> {
        self.record(EngineCall::AcquireMedia(*constraints));
        if self.script.fail_media {
            return Err(EngineError::Fatal("no capture device".into()));
        }
        let mut track_ids = Vec::new();
        if constraints.audio {
            track_ids.push(format!("mock-{}-audio", self.id));
        }
        if constraints.video {
            track_ids.push(format!("mock-{}-video", self.id));
        }
        Ok(MediaHandle { track_ids })
    }

    async fn create_local_description(
        &self,
        role: Role,
    ) -> Result<SessionDescription, EngineError> {
        self.record(EngineCall::CreateDescription(role));
        let kind = match role {
            Role::Caller => "offer",
            Role::Callee => "answer",
        };
        Ok(SessionDescription(json!({
            "type": kind,
            "sdp": format!("mock-{kind}-{}", self.id),
        })))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(EngineCall::SetRemoteDescription(description.clone()));
        if self.script.reject_remote_description {
            return Err(EngineError::Rejected("unparseable description".into()));
        }
        state.remote = Some(description);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), EngineError> {
        self.record(EngineCall::AddCandidate(candidate.clone()));
        if self.script.fatal_candidates {
            return Err(EngineError::Fatal("ice agent gone".into()));
        }
        if self.script.rejected_candidates.contains(&candidate.0) {
            return Err(EngineError::Rejected(format!("bad candidate {}", candidate.0)));
        }
        Ok(())
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        self.state.lock().candidate_handler = Some(handler);
    }

    fn on_remote_track(&self, handler: TrackHandler) {
        self.state.lock().track_handler = Some(handler);
    }

    fn on_connectivity(&self, handler: ConnectivityHandler) {
        self.state.lock().connectivity_handler = Some(handler);
    }

    async fn close(&self) -> Result<(), EngineError> {
        // Handlers stay registered: a real engine may still report after close.
        self.record(EngineCall::Close);
        Ok(())
    }
}

/// Hands out [`MockEngine`]s and keeps them around for inspection.
#[derive(Default)]
pub struct MockEngineFactory {
    script: MockScript,
    next_id: AtomicU64,
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: MockScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn engines(&self) -> Vec<Arc<MockEngine>> {
        self.engines.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockEngine>> {
        self.engines.lock().last().cloned()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self) -> Result<Arc<dyn TransportEngine>, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let engine = Arc::new(MockEngine::new(id, self.script.clone()));
        self.engines.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}
