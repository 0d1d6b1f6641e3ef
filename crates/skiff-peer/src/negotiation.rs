//! Offer/answer sequencing for one call attempt.
//!
//! A [`NegotiationSession`] owns at most one engine. Remote candidates are
//! only handed to it once a remote description has been applied; anything
//! earlier waits in `pending_candidates` and is replayed in arrival order
//! right after the description lands.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use skiff_proto::{Envelope, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::engine::{
    Candidate, CandidateHandler, Connectivity, ConnectivityHandler, EngineError, EngineFactory,
    MediaConstraints, RemoteTrack, Role, SessionDescription, TrackHandler, TransportEngine,
};

pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    fn is_pending(self) -> bool {
        matches!(
            self,
            NegotiationState::Offering
                | NegotiationState::AwaitingAnswer
                | NegotiationState::Answering
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What an operation did with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Buffered,
    Ignored,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("transport failed: {0}")]
    TransportFatal(String),
    #[error("negotiation did not complete within {0:?}")]
    Timeout(Duration),
    #[error("signaling channel closed")]
    Signaling,
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub constraints: MediaConstraints,
    pub timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    LocalCandidate(Candidate),
    RemoteTrack(RemoteTrack),
    Connectivity(Connectivity),
}

/// An engine callback, tagged with the generation of the session it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub generation: u64,
    pub kind: SessionEventKind,
}

/// Routes engine callbacks for one session back to whoever drives it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn new(generation: u64, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, events }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn candidate_handler(&self) -> CandidateHandler {
        let handle = self.clone();
        Box::new(move |candidate| handle.emit(SessionEventKind::LocalCandidate(candidate)))
    }

    pub fn track_handler(&self) -> TrackHandler {
        let handle = self.clone();
        Box::new(move |track| handle.emit(SessionEventKind::RemoteTrack(track)))
    }

    pub fn connectivity_handler(&self) -> ConnectivityHandler {
        let handle = self.clone();
        Box::new(move |state| handle.emit(SessionEventKind::Connectivity(state)))
    }

    fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            generation: self.generation,
            kind,
        };
        if self.events.send(event).is_err() {
            trace!(
                target = "skiff::negotiation",
                generation = self.generation,
                "session event dropped, driver gone"
            );
        }
    }
}

pub struct NegotiationSession {
    state: NegotiationState,
    role: Option<Role>,
    peer: Option<SessionId>,
    remote_description_set: bool,
    pending_candidates: VecDeque<Candidate>,
    engine: Option<Arc<dyn TransportEngine>>,
    factory: Arc<dyn EngineFactory>,
    handle: SessionHandle,
    outbound: mpsc::UnboundedSender<Envelope>,
    config: NegotiationConfig,
    deadline: Option<Instant>,
}

impl NegotiationSession {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        handle: SessionHandle,
        outbound: mpsc::UnboundedSender<Envelope>,
        config: NegotiationConfig,
    ) -> Self {
        Self {
            state: NegotiationState::Idle,
            role: None,
            peer: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            engine: None,
            factory,
            handle,
            outbound,
            config,
            deadline: None,
        }
    }

    /// Binds the remote peer up front so the engine is never built without one.
    pub fn with_peer(mut self, peer: SessionId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn peer(&self) -> Option<&SessionId> {
        self.peer.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.handle.generation()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    /// Fixes the remote peer while still idle, e.g. when its candidates
    /// arrive ahead of its offer.
    pub fn bind_peer(&mut self, peer: SessionId) -> Result<(), NegotiationError> {
        self.require_idle("bind_peer")?;
        if self.peer.as_ref().is_some_and(|current| *current != peer) {
            return Err(NegotiationError::InvalidState {
                operation: "bind_peer",
                state: self.state,
            });
        }
        self.peer = Some(peer);
        Ok(())
    }

    /// Caller path: build an engine, send an offer, wait for the answer.
    pub async fn initiate(&mut self, peer: SessionId) -> Result<Outcome, NegotiationError> {
        self.bind_peer(peer.clone())?;
        self.role = Some(Role::Caller);
        self.enter(NegotiationState::Offering);

        let engine = self.start_engine().await?;
        let offer = match engine.create_local_description(Role::Caller).await {
            Ok(offer) => offer,
            Err(err) => return Err(self.fail(err).await),
        };
        self.send(Envelope::offer(peer, offer.into_value())).await?;
        self.enter(NegotiationState::AwaitingAnswer);
        Ok(Outcome::Applied)
    }

    /// Callee path: apply the remote offer, replay buffered candidates and answer.
    pub async fn receive_offer(
        &mut self,
        from: SessionId,
        description: SessionDescription,
    ) -> Result<Outcome, NegotiationError> {
        self.bind_peer(from.clone())?;
        self.role = Some(Role::Callee);
        self.enter(NegotiationState::Answering);

        let engine = self.start_engine().await?;
        if let Err(err) = engine.set_remote_description(description).await {
            return Err(self.fail(err).await);
        }
        self.remote_description_set = true;
        self.flush_pending(&engine).await?;

        let answer = match engine.create_local_description(Role::Callee).await {
            Ok(answer) => answer,
            Err(err) => return Err(self.fail(err).await),
        };
        self.send(Envelope::answer(from, answer.into_value())).await?;
        Ok(Outcome::Applied)
    }

    pub async fn receive_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<Outcome, NegotiationError> {
        match self.state {
            NegotiationState::AwaitingAnswer => {}
            NegotiationState::Connected | NegotiationState::Failed | NegotiationState::Closed => {
                debug!(
                    target = "skiff::negotiation",
                    state = %self.state,
                    "late answer ignored"
                );
                return Ok(Outcome::Ignored);
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    operation: "receive_answer",
                    state,
                })
            }
        }
        let Some(engine) = self.engine.clone() else {
            return Err(self
                .fail(EngineError::Fatal("no engine while awaiting answer".into()))
                .await);
        };
        if engine.has_remote_description().await {
            debug!(target = "skiff::negotiation", "duplicate answer ignored");
            return Ok(Outcome::Ignored);
        }
        if let Err(err) = engine.set_remote_description(description).await {
            return Err(self.fail(err).await);
        }
        self.remote_description_set = true;
        self.flush_pending(&engine).await?;
        self.enter(NegotiationState::Connected);
        Ok(Outcome::Applied)
    }

    pub async fn receive_candidate(
        &mut self,
        candidate: Candidate,
    ) -> Result<Outcome, NegotiationError> {
        if self.state.is_terminal() {
            debug!(
                target = "skiff::negotiation",
                state = %self.state,
                "candidate after teardown dropped"
            );
            return Ok(Outcome::Ignored);
        }
        match self.engine.clone() {
            Some(engine) if self.remote_description_set => {
                self.apply_candidate(&engine, candidate).await
            }
            _ => {
                self.pending_candidates.push_back(candidate);
                trace!(
                    target = "skiff::negotiation",
                    pending = self.pending_candidates.len(),
                    "remote candidate buffered"
                );
                Ok(Outcome::Buffered)
            }
        }
    }

    /// Forwards a candidate the local engine discovered.
    pub async fn local_candidate(
        &mut self,
        candidate: Candidate,
    ) -> Result<Outcome, NegotiationError> {
        if self.state.is_terminal() {
            return Ok(Outcome::Ignored);
        }
        let Some(peer) = self.peer.clone() else {
            warn!(
                target = "skiff::negotiation",
                "local candidate without a peer dropped"
            );
            return Ok(Outcome::Ignored);
        };
        self.send(Envelope::ice(peer, candidate.into_value())).await?;
        Ok(Outcome::Applied)
    }

    pub fn remote_track(&self, track: &RemoteTrack) -> Outcome {
        if self.state.is_terminal() {
            return Outcome::Ignored;
        }
        info!(
            target = "skiff::negotiation",
            peer = ?self.peer,
            track = %track.id,
            kind = %track.kind,
            "remote track received"
        );
        Outcome::Applied
    }

    pub async fn connectivity(
        &mut self,
        connectivity: Connectivity,
    ) -> Result<Outcome, NegotiationError> {
        if self.state.is_terminal() || self.engine.is_none() {
            return Ok(Outcome::Ignored);
        }
        match connectivity {
            Connectivity::Connected => {
                if self.state != NegotiationState::Connected {
                    self.enter(NegotiationState::Connected);
                }
                Ok(Outcome::Applied)
            }
            Connectivity::Failed => Err(self
                .fail(EngineError::Fatal("connectivity failed".into()))
                .await),
            Connectivity::Closed => {
                self.teardown(NegotiationState::Closed).await;
                Ok(Outcome::Applied)
            }
            Connectivity::Connecting | Connectivity::Disconnected => {
                debug!(
                    target = "skiff::negotiation",
                    ?connectivity,
                    "connectivity update"
                );
                Ok(Outcome::Ignored)
            }
        }
    }

    pub async fn close(&mut self) -> Outcome {
        if self.state.is_terminal() {
            return Outcome::Ignored;
        }
        self.teardown(NegotiationState::Closed).await;
        Outcome::Applied
    }

    /// Fails a negotiation that has been pending past its deadline.
    pub async fn expire(&mut self, now: Instant) -> Result<Outcome, NegotiationError> {
        match self.deadline {
            Some(deadline) if self.state.is_pending() && now >= deadline => {
                warn!(
                    target = "skiff::negotiation",
                    peer = ?self.peer,
                    state = %self.state,
                    timeout = ?self.config.timeout,
                    "negotiation timed out"
                );
                self.teardown(NegotiationState::Failed).await;
                Err(NegotiationError::Timeout(self.config.timeout))
            }
            _ => Ok(Outcome::Ignored),
        }
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::Idle {
            Ok(())
        } else {
            Err(NegotiationError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn enter(&mut self, next: NegotiationState) {
        debug!(
            target = "skiff::negotiation",
            peer = ?self.peer,
            from = %self.state,
            to = %next,
            "state transition"
        );
        if !next.is_pending() {
            self.deadline = None;
        } else if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.config.timeout);
        }
        self.state = next;
    }

    async fn start_engine(&mut self) -> Result<Arc<dyn TransportEngine>, NegotiationError> {
        let engine = match self.factory.create().await {
            Ok(engine) => engine,
            Err(err) => return Err(self.fail(err).await),
        };
        engine.on_local_candidate(self.handle.candidate_handler());
        engine.on_remote_track(self.handle.track_handler());
        engine.on_connectivity(self.handle.connectivity_handler());
        self.engine = Some(Arc::clone(&engine));

        if let Err(err) = engine.acquire_local_media(&self.config.constraints).await {
            return Err(self.fail(err).await);
        }
        Ok(engine)
    }

    async fn flush_pending(
        &mut self,
        engine: &Arc<dyn TransportEngine>,
    ) -> Result<(), NegotiationError> {
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                target = "skiff::negotiation",
                count = pending.len(),
                "replaying buffered candidates"
            );
        }
        for candidate in pending {
            self.apply_candidate(engine, candidate).await?;
        }
        Ok(())
    }

    async fn apply_candidate(
        &mut self,
        engine: &Arc<dyn TransportEngine>,
        candidate: Candidate,
    ) -> Result<Outcome, NegotiationError> {
        match engine.add_candidate(candidate).await {
            Ok(()) => Ok(Outcome::Applied),
            Err(err) if !err.is_fatal() => {
                warn!(target = "skiff::negotiation", error = %err, "candidate skipped");
                Ok(Outcome::Ignored)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn send(&mut self, envelope: Envelope) -> Result<(), NegotiationError> {
        if self.outbound.send(envelope).is_err() {
            warn!(target = "skiff::negotiation", "signaling channel closed");
            self.teardown(NegotiationState::Failed).await;
            return Err(NegotiationError::Signaling);
        }
        Ok(())
    }

    async fn fail(&mut self, err: EngineError) -> NegotiationError {
        warn!(
            target = "skiff::negotiation",
            peer = ?self.peer,
            state = %self.state,
            error = %err,
            "negotiation failed"
        );
        self.teardown(NegotiationState::Failed).await;
        NegotiationError::TransportFatal(err.to_string())
    }

    async fn teardown(&mut self, terminal: NegotiationState) {
        self.enter(terminal);
        self.pending_candidates.clear();
        if let Some(engine) = self.engine.take() {
            if let Err(err) = engine.close().await {
                warn!(target = "skiff::negotiation", error = %err, "engine close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineCall, MockEngineFactory, MockScript};
    use serde_json::json;
    use skiff_proto::EnvelopeKind;

    struct Harness {
        factory: Arc<MockEngineFactory>,
        session: NegotiationSession,
        outbound: mpsc::UnboundedReceiver<Envelope>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn harness(script: MockScript) -> Harness {
        let factory = Arc::new(MockEngineFactory::with_script(script));
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let session = NegotiationSession::new(
            factory.clone(),
            SessionHandle::new(7, events_tx),
            outbound_tx,
            NegotiationConfig::default(),
        );
        Harness {
            factory,
            session,
            outbound,
            events,
        }
    }

    fn candidate(name: &str) -> Candidate {
        Candidate(json!({ "candidate": name, "sdpMid": "0", "sdpMLineIndex": 0 }))
    }

    fn answer() -> SessionDescription {
        SessionDescription(json!({"type": "answer", "sdp": "remote-answer"}))
    }

    fn offer() -> SessionDescription {
        SessionDescription(json!({"type": "offer", "sdp": "remote-offer"}))
    }

    #[test_timeout::timeout]
    async fn initiate_sends_offer_and_awaits_answer() {
        let mut h = harness(MockScript::default());
        let outcome = h.session.initiate("bob".into()).await.unwrap();

        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(h.session.state(), NegotiationState::AwaitingAnswer);
        assert_eq!(h.session.role(), Some(Role::Caller));
        assert!(h.session.deadline().is_some());

        let sent = h.outbound.try_recv().unwrap();
        assert_eq!(sent.kind, EnvelopeKind::Offer);
        assert_eq!(sent.to, Some(SessionId::from("bob")));
        assert_eq!(sent.payload["type"], json!("offer"));

        let engine = h.factory.last().unwrap();
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::AcquireMedia(MediaConstraints::default()),
                EngineCall::CreateDescription(Role::Caller),
            ]
        );
    }

    #[test_timeout::timeout]
    async fn candidates_reach_engine_only_after_answer_in_arrival_order() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();

        for name in ["n1", "n2", "n3"] {
            let outcome = h.session.receive_candidate(candidate(name)).await.unwrap();
            assert_eq!(outcome, Outcome::Buffered);
        }
        let engine = h.factory.last().unwrap();
        assert!(engine.candidates().is_empty());
        assert_eq!(h.session.pending_candidates(), 3);

        assert_eq!(
            h.session.receive_answer(answer()).await.unwrap(),
            Outcome::Applied
        );
        assert_eq!(h.session.state(), NegotiationState::Connected);
        assert_eq!(h.session.pending_candidates(), 0);

        for name in ["m1", "m2"] {
            let outcome = h.session.receive_candidate(candidate(name)).await.unwrap();
            assert_eq!(outcome, Outcome::Applied);
        }

        let expected: Vec<_> = ["n1", "n2", "n3", "m1", "m2"]
            .into_iter()
            .map(candidate)
            .collect();
        assert_eq!(engine.candidates(), expected);

        let calls = engine.calls();
        let remote_at = calls
            .iter()
            .position(|call| matches!(call, EngineCall::SetRemoteDescription(_)))
            .unwrap();
        let first_candidate_at = calls
            .iter()
            .position(|call| matches!(call, EngineCall::AddCandidate(_)))
            .unwrap();
        assert!(remote_at < first_candidate_at);
    }

    #[test_timeout::timeout]
    async fn callee_replays_early_candidates_before_answering() {
        let mut h = harness(MockScript::default());
        h.session.bind_peer("alice".into()).unwrap();
        assert_eq!(
            h.session.receive_candidate(candidate("c1")).await.unwrap(),
            Outcome::Buffered
        );
        assert_eq!(
            h.session.receive_candidate(candidate("c2")).await.unwrap(),
            Outcome::Buffered
        );

        let outcome = h
            .session
            .receive_offer("alice".into(), offer())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(h.session.state(), NegotiationState::Answering);
        assert!(h.session.remote_description_set());

        let engine = h.factory.last().unwrap();
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::AcquireMedia(MediaConstraints::default()),
                EngineCall::SetRemoteDescription(offer()),
                EngineCall::AddCandidate(candidate("c1")),
                EngineCall::AddCandidate(candidate("c2")),
                EngineCall::CreateDescription(Role::Callee),
            ]
        );

        let sent = h.outbound.try_recv().unwrap();
        assert_eq!(sent.kind, EnvelopeKind::Answer);
        assert_eq!(sent.to, Some(SessionId::from("alice")));

        assert_eq!(
            h.session
                .connectivity(Connectivity::Connected)
                .await
                .unwrap(),
            Outcome::Applied
        );
        assert_eq!(h.session.state(), NegotiationState::Connected);
    }

    #[test_timeout::timeout]
    async fn offer_from_another_peer_than_bound_is_refused() {
        let mut h = harness(MockScript::default());
        h.session.bind_peer("alice".into()).unwrap();
        let err = h
            .session
            .receive_offer("mallory".into(), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidState { .. }));
        assert!(h.factory.engines().is_empty());
    }

    #[test_timeout::timeout]
    async fn rejected_offer_fails_without_answering() {
        let mut h = harness(MockScript {
            reject_remote_description: true,
            ..MockScript::default()
        });
        h.session.bind_peer("alice".into()).unwrap();
        h.session.receive_candidate(candidate("c1")).await.unwrap();

        let err = h
            .session
            .receive_offer("alice".into(), offer())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::TransportFatal(_)));
        assert_eq!(h.session.state(), NegotiationState::Failed);
        assert!(!h.session.has_engine());
        assert!(!h.session.remote_description_set());
        assert_eq!(h.session.pending_candidates(), 0);
        assert!(h.outbound.try_recv().is_err());

        let engine = h.factory.last().unwrap();
        assert!(engine.candidates().is_empty());
        assert_eq!(engine.calls().last(), Some(&EngineCall::Close));
    }

    #[test_timeout::timeout]
    async fn rejected_answer_fails_the_call() {
        let mut h = harness(MockScript {
            reject_remote_description: true,
            ..MockScript::default()
        });
        h.session.initiate("bob".into()).await.unwrap();
        let _offer = h.outbound.try_recv().unwrap();
        h.session.receive_candidate(candidate("b1")).await.unwrap();

        let err = h.session.receive_answer(answer()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::TransportFatal(_)));
        assert_eq!(h.session.state(), NegotiationState::Failed);
        assert!(!h.session.has_engine());
        assert!(h.session.deadline().is_none());

        let engine = h.factory.last().unwrap();
        assert!(engine.candidates().is_empty());
        assert!(engine.is_closed());
        assert!(h.outbound.try_recv().is_err());
    }

    #[test_timeout::timeout]
    async fn second_answer_leaves_engine_untouched() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();
        h.session.receive_answer(answer()).await.unwrap();

        let engine = h.factory.last().unwrap();
        let before = engine.calls();
        let outcome = h
            .session
            .receive_answer(SessionDescription(json!({"type": "answer", "sdp": "late"})))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(engine.calls(), before);
        assert_eq!(h.session.state(), NegotiationState::Connected);
    }

    #[test_timeout::timeout]
    async fn answer_before_offer_is_invalid() {
        let mut h = harness(MockScript::default());
        let err = h.session.receive_answer(answer()).await.unwrap_err();
        assert_eq!(
            err,
            NegotiationError::InvalidState {
                operation: "receive_answer",
                state: NegotiationState::Idle,
            }
        );
    }

    #[test_timeout::timeout]
    async fn rejected_candidates_are_skipped() {
        let mut h = harness(MockScript {
            rejected_candidates: vec![candidate("bad").0],
            ..MockScript::default()
        });
        h.session.initiate("bob".into()).await.unwrap();
        h.session.receive_candidate(candidate("c1")).await.unwrap();
        h.session.receive_candidate(candidate("bad")).await.unwrap();
        h.session.receive_candidate(candidate("c2")).await.unwrap();
        h.session.receive_answer(answer()).await.unwrap();

        let outcome = h.session.receive_candidate(candidate("bad")).await.unwrap();
        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(h.session.state(), NegotiationState::Connected);

        let engine = h.factory.last().unwrap();
        assert_eq!(
            engine.candidates(),
            vec![
                candidate("c1"),
                candidate("bad"),
                candidate("c2"),
                candidate("bad")
            ]
        );
        assert!(!engine.is_closed());
    }

    #[test_timeout::timeout]
    async fn fatal_engine_error_fails_and_releases() {
        let mut h = harness(MockScript {
            fatal_candidates: true,
            ..MockScript::default()
        });
        h.session.initiate("bob".into()).await.unwrap();
        h.session.receive_candidate(candidate("c1")).await.unwrap();
        h.session.receive_candidate(candidate("c2")).await.unwrap();

        let err = h.session.receive_answer(answer()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::TransportFatal(_)));
        assert_eq!(h.session.state(), NegotiationState::Failed);
        assert!(!h.session.has_engine());
        assert_eq!(h.session.pending_candidates(), 0);

        let engine = h.factory.last().unwrap();
        assert!(engine.is_closed());
        assert_eq!(engine.candidates(), vec![candidate("c1")]);
    }

    #[test_timeout::timeout]
    async fn media_failure_is_fatal() {
        let mut h = harness(MockScript {
            fail_media: true,
            ..MockScript::default()
        });
        let err = h.session.initiate("bob".into()).await.unwrap_err();
        assert!(matches!(err, NegotiationError::TransportFatal(_)));
        assert_eq!(h.session.state(), NegotiationState::Failed);
        assert!(h.factory.last().unwrap().is_closed());
        assert!(h.outbound.try_recv().is_err());
    }

    #[test_timeout::timeout]
    async fn close_discards_buffer_and_releases_engine_once() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();
        h.session.receive_candidate(candidate("c1")).await.unwrap();

        assert_eq!(h.session.close().await, Outcome::Applied);
        assert_eq!(h.session.state(), NegotiationState::Closed);
        assert_eq!(h.session.pending_candidates(), 0);
        assert!(!h.session.has_engine());
        assert_eq!(h.session.close().await, Outcome::Ignored);
        assert_eq!(
            h.session.receive_candidate(candidate("c2")).await.unwrap(),
            Outcome::Ignored
        );
        assert_eq!(
            h.session.receive_answer(answer()).await.unwrap(),
            Outcome::Ignored
        );

        let engine = h.factory.last().unwrap();
        let closes = engine
            .calls()
            .into_iter()
            .filter(|call| *call == EngineCall::Close)
            .count();
        assert_eq!(closes, 1);
        assert!(engine.candidates().is_empty());
    }

    #[test_timeout::timeout]
    async fn pending_negotiation_expires_after_deadline() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();
        let deadline = h.session.deadline().unwrap();

        assert_eq!(
            h.session
                .expire(deadline - Duration::from_millis(1))
                .await
                .unwrap(),
            Outcome::Ignored
        );
        assert_eq!(h.session.state(), NegotiationState::AwaitingAnswer);

        let err = h.session.expire(deadline).await.unwrap_err();
        assert_eq!(err, NegotiationError::Timeout(DEFAULT_NEGOTIATION_TIMEOUT));
        assert_eq!(h.session.state(), NegotiationState::Failed);
        assert!(h.factory.last().unwrap().is_closed());
    }

    #[test_timeout::timeout]
    async fn connected_session_does_not_expire() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();
        h.session.receive_answer(answer()).await.unwrap();
        let later = Instant::now() + DEFAULT_NEGOTIATION_TIMEOUT * 2;
        assert_eq!(h.session.expire(later).await.unwrap(), Outcome::Ignored);
        assert_eq!(h.session.state(), NegotiationState::Connected);
    }

    #[test_timeout::timeout]
    async fn local_candidates_are_tagged_and_forwarded() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();
        let _offer = h.outbound.try_recv().unwrap();

        let engine = h.factory.last().unwrap();
        engine.fire_local_candidate(candidate("local-1"));
        let event = h.events.try_recv().unwrap();
        assert_eq!(event.generation, 7);
        let SessionEventKind::LocalCandidate(local) = event.kind else {
            panic!("expected a local candidate event");
        };

        assert_eq!(
            h.session.local_candidate(local).await.unwrap(),
            Outcome::Applied
        );
        let sent = h.outbound.try_recv().unwrap();
        assert_eq!(sent.kind, EnvelopeKind::Ice);
        assert_eq!(sent.to, Some(SessionId::from("bob")));
        assert_eq!(sent.payload, candidate("local-1").0);
    }

    #[test_timeout::timeout]
    async fn closed_signaling_fails_the_attempt() {
        let mut h = harness(MockScript::default());
        drop(std::mem::replace(&mut h.outbound, mpsc::unbounded_channel().1));

        let err = h.session.initiate("bob".into()).await.unwrap_err();
        assert_eq!(err, NegotiationError::Signaling);
        assert_eq!(h.session.state(), NegotiationState::Failed);
        assert!(h.factory.last().unwrap().is_closed());
    }

    #[test_timeout::timeout]
    async fn transport_connectivity_failure_fails_session() {
        let mut h = harness(MockScript::default());
        h.session.initiate("bob".into()).await.unwrap();
        let err = h
            .session
            .connectivity(Connectivity::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::TransportFatal(_)));
        assert_eq!(h.session.state(), NegotiationState::Failed);
    }
}
