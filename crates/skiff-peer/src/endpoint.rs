//! Drives the negotiation for one local session id.
//!
//! Inbound envelopes, engine callbacks, user commands and the negotiation
//! deadline all funnel into [`Endpoint::run`], which handles them one at a
//! time. At most one [`NegotiationSession`] is live; a new offer or call
//! replaces it. Candidates that arrive while no session is live are held
//! per sender until that sender's offer starts one.

use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::Arc;

use skiff_proto::{Envelope, EnvelopeKind, SessionId};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::engine::{Candidate, EngineFactory, RemoteTrack, SessionDescription};
use crate::negotiation::{
    NegotiationConfig, NegotiationError, NegotiationSession, NegotiationState, Outcome,
    SessionEvent, SessionEventKind, SessionHandle,
};

/// Per-sender cap on candidates held ahead of an offer.
const MAX_EARLY_CANDIDATES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(SessionId),
    HangUp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    StateChanged {
        peer: SessionId,
        state: NegotiationState,
    },
    RemoteTrack {
        peer: SessionId,
        track: RemoteTrack,
    },
    /// The session with `peer` is gone; `Failed` means the call did not connect.
    CallEnded {
        peer: SessionId,
        state: NegotiationState,
    },
}

struct ActiveSession {
    peer: SessionId,
    session: NegotiationSession,
}

pub struct Endpoint {
    local_id: SessionId,
    factory: Arc<dyn EngineFactory>,
    config: NegotiationConfig,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    session_events_tx: mpsc::UnboundedSender<SessionEvent>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    active: Option<ActiveSession>,
    early_candidates: HashMap<SessionId, VecDeque<(Instant, Candidate)>>,
    generation: u64,
}

impl Endpoint {
    pub fn new(
        local_id: SessionId,
        factory: Arc<dyn EngineFactory>,
        outbound: mpsc::UnboundedSender<Envelope>,
        config: NegotiationConfig,
    ) -> (Self, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (session_events_tx, session_events) = mpsc::unbounded_channel();
        let endpoint = Self {
            local_id,
            factory,
            config,
            outbound,
            events,
            session_events_tx,
            session_events,
            active: None,
            early_candidates: HashMap::new(),
            generation: 0,
        };
        (endpoint, events_rx)
    }

    pub fn local_id(&self) -> &SessionId {
        &self.local_id
    }

    /// Runs until the inbound signaling stream ends.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut commands_open = true;
        loop {
            let deadline = self
                .active
                .as_ref()
                .and_then(|active| active.session.deadline());
            tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        info!(target = "skiff::endpoint", id = %self.local_id, "signaling stream ended");
                        break;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => commands_open = false,
                },
                Some(event) = self.session_events.recv() => self.handle_session_event(event).await,
                _ = sleep_until(deadline) => self.handle_deadline().await,
            }
        }
        self.end_active().await;
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Some(from) = envelope.from.clone() else {
            debug!(target = "skiff::endpoint", kind = envelope.kind.as_str(), "envelope without sender dropped");
            return;
        };
        match envelope.kind {
            EnvelopeKind::Register => {
                debug!(target = "skiff::endpoint", %from, "unexpected register envelope ignored")
            }
            EnvelopeKind::Offer => {
                self.on_offer(from, SessionDescription(envelope.payload))
                    .await
            }
            EnvelopeKind::Answer => {
                self.on_answer(from, SessionDescription(envelope.payload))
                    .await
            }
            EnvelopeKind::Ice => {
                self.on_remote_candidate(from, Candidate(envelope.payload))
                    .await
            }
        }
    }

    async fn on_offer(&mut self, from: SessionId, description: SessionDescription) {
        self.end_active().await;
        info!(target = "skiff::endpoint", peer = %from, "incoming call");
        let early = self.take_early_candidates(&from);
        let mut active = self.new_session(from.clone());
        for candidate in early {
            let result = active.session.receive_candidate(candidate).await;
            self.log_result("early candidate", &from, result);
        }
        let before = active.session.state();
        let result = active.session.receive_offer(from.clone(), description).await;
        self.active = Some(active);
        self.log_result("offer", &from, result);
        self.settle(before);
    }

    async fn on_answer(&mut self, from: SessionId, description: SessionDescription) {
        let Some(active) = self.active_for(&from) else {
            debug!(target = "skiff::endpoint", peer = %from, "answer from unexpected peer dropped");
            return;
        };
        let before = active.session.state();
        let result = active.session.receive_answer(description).await;
        self.log_result("answer", &from, result);
        self.settle(before);
    }

    async fn on_remote_candidate(&mut self, from: SessionId, candidate: Candidate) {
        match self.active.as_mut() {
            Some(active) if active.peer == from => {
                let before = active.session.state();
                let result = active.session.receive_candidate(candidate).await;
                self.log_result("candidate", &from, result);
                self.settle(before);
            }
            Some(active) => {
                debug!(
                    target = "skiff::endpoint",
                    peer = %from,
                    current = %active.peer,
                    "candidate from unexpected peer dropped"
                );
            }
            None => {
                let early = self.early_candidates.entry(from.clone()).or_default();
                if early.len() >= MAX_EARLY_CANDIDATES {
                    debug!(target = "skiff::endpoint", peer = %from, "early candidate buffer full, dropping");
                    return;
                }
                early.push_back((Instant::now(), candidate));
                trace!(
                    target = "skiff::endpoint",
                    peer = %from,
                    held = early.len(),
                    "candidate ahead of offer held"
                );
            }
        }
    }

    /// Hands back `peer`'s held candidates in arrival order, minus any older
    /// than the negotiation timeout. Everyone else's are discarded.
    fn take_early_candidates(&mut self, peer: &SessionId) -> Vec<Candidate> {
        let held = self.early_candidates.remove(peer).unwrap_or_default();
        self.early_candidates.clear();
        let now = Instant::now();
        let timeout = self.config.timeout;
        held.into_iter()
            .filter(|(arrived, _)| now.duration_since(*arrived) <= timeout)
            .map(|(_, candidate)| candidate)
            .collect()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call(peer) => {
                if peer == self.local_id {
                    warn!(target = "skiff::endpoint", %peer, "refusing to call ourselves");
                    return;
                }
                self.end_active().await;
                // Nothing held so far can belong to an offer we have not sent yet.
                self.early_candidates.clear();
                info!(target = "skiff::endpoint", %peer, "calling");
                let mut active = self.new_session(peer.clone());
                let before = active.session.state();
                let result = active.session.initiate(peer.clone()).await;
                self.active = Some(active);
                self.log_result("call", &peer, result);
                self.settle(before);
            }
            Command::HangUp => self.end_active().await,
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.session.generation() == event.generation)
        else {
            trace!(
                target = "skiff::endpoint",
                generation = event.generation,
                "event from superseded session dropped"
            );
            return;
        };
        let peer = active.peer.clone();
        let before = active.session.state();
        match event.kind {
            SessionEventKind::LocalCandidate(candidate) => {
                let result = active.session.local_candidate(candidate).await;
                self.log_result("local candidate", &peer, result);
            }
            SessionEventKind::RemoteTrack(track) => {
                if active.session.remote_track(&track) == Outcome::Applied {
                    self.emit(EndpointEvent::RemoteTrack { peer, track });
                }
            }
            SessionEventKind::Connectivity(connectivity) => {
                let result = active.session.connectivity(connectivity).await;
                self.log_result("connectivity", &peer, result);
            }
        }
        self.settle(before);
    }

    async fn handle_deadline(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let peer = active.peer.clone();
        let before = active.session.state();
        let result = active.session.expire(Instant::now()).await;
        self.log_result("deadline", &peer, result);
        self.settle(before);
    }

    fn new_session(&mut self, peer: SessionId) -> ActiveSession {
        self.generation += 1;
        let handle = SessionHandle::new(self.generation, self.session_events_tx.clone());
        let session = NegotiationSession::new(
            Arc::clone(&self.factory),
            handle,
            self.outbound.clone(),
            self.config.clone(),
        )
        .with_peer(peer.clone());
        ActiveSession { peer, session }
    }

    fn active_for(&mut self, peer: &SessionId) -> Option<&mut ActiveSession> {
        self.active.as_mut().filter(|active| active.peer == *peer)
    }

    /// Publishes a state change and drops the session once it is terminal.
    fn settle(&mut self, before: NegotiationState) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let peer = active.peer.clone();
        let state = active.session.state();
        if state != before {
            self.emit(EndpointEvent::StateChanged {
                peer: peer.clone(),
                state,
            });
        }
        if state.is_terminal() {
            self.active = None;
            self.emit(EndpointEvent::CallEnded { peer, state });
        }
    }

    async fn end_active(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.session.close().await;
        let state = active.session.state();
        self.emit(EndpointEvent::StateChanged {
            peer: active.peer.clone(),
            state,
        });
        self.emit(EndpointEvent::CallEnded {
            peer: active.peer,
            state,
        });
    }

    fn log_result(
        &self,
        operation: &'static str,
        peer: &SessionId,
        result: Result<Outcome, NegotiationError>,
    ) {
        match result {
            Ok(outcome) => trace!(target = "skiff::endpoint", operation, %peer, ?outcome),
            Err(err @ NegotiationError::InvalidState { .. }) => {
                debug!(target = "skiff::endpoint", operation, %peer, error = %err, "envelope out of sequence")
            }
            Err(err) => warn!(target = "skiff::endpoint", operation, %peer, error = %err, "negotiation error"),
        }
    }

    fn emit(&self, event: EndpointEvent) {
        if self.events.send(event).is_err() {
            trace!(target = "skiff::endpoint", "no listener for endpoint events");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
