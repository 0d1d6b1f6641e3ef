use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use skiff_proto::{Envelope, EnvelopeError, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::{ConnectionHandle, ConnectionId, Registration, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Malformed(#[from] EnvelopeError),
    #[error("no connection registered for {0}")]
    UnknownRecipient(SessionId),
    #[error("connection for {0} closed before delivery")]
    RecipientGone(SessionId),
    #[error(transparent)]
    Registration(#[from] RegistryError),
}

impl RelayError {
    /// Stable label for the dropped-envelope counter.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::Malformed(_) => "malformed",
            RelayError::UnknownRecipient(_) => "unknown_recipient",
            RelayError::RecipientGone(_) => "recipient_gone",
            RelayError::Registration(_) => "registration",
        }
    }
}

/// What the relay did with one inbound message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub registered: Option<SessionId>,
    pub forwarded_to: Option<SessionId>,
}

/// Per-socket state owned by that socket's task.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    sender_id: Option<SessionId>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Id this connection last registered, used as `from` on everything it sends.
    pub fn sender_id(&self) -> Option<&SessionId> {
        self.sender_id.as_ref()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

/// Routing core of the relay, independent of the socket layer.
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<Registry>,
    next_connection: Arc<AtomicU64>,
    max_message_bytes: usize,
}

impl RelayState {
    pub fn new(registry: Arc<Registry>, max_message_bytes: usize) -> Self {
        Self {
            registry,
            next_connection: Arc::new(AtomicU64::new(1)),
            max_message_bytes,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            Arc::new(Registry::new(config.collision_policy)),
            config.max_message_bytes,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn open_connection(
        &self,
        remote_addr: Option<SocketAddr>,
    ) -> (Connection, mpsc::UnboundedReceiver<Envelope>) {
        let id = ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        counter!("skiff_relay_connections_total", 1);
        debug!(connection = %id, ?remote_addr, "connection opened");
        (
            Connection {
                handle: ConnectionHandle::new(id, tx, remote_addr),
                sender_id: None,
            },
            rx,
        )
    }

    pub fn handle_text(
        &self,
        connection: &mut Connection,
        text: &str,
    ) -> Result<Dispatch, RelayError> {
        if text.len() > self.max_message_bytes {
            return Err(RelayError::Malformed(EnvelopeError::Malformed(format!(
                "message of {} bytes exceeds the {} byte limit",
                text.len(),
                self.max_message_bytes
            ))));
        }
        let envelope = Envelope::parse(text)?;
        let mut dispatch = Dispatch::default();

        if let Some(id) = envelope.registration_id() {
            match self.registry.register(id.clone(), connection.handle.clone())? {
                Registration::Replaced { previous } => info!(
                    session_id = %id,
                    connection = %connection.id(),
                    previous = %previous,
                    "session id taken over by a new connection"
                ),
                Registration::Created | Registration::Refreshed => debug!(
                    session_id = %id,
                    connection = %connection.id(),
                    "session id registered"
                ),
            }
            connection.sender_id = Some(id.clone());
            dispatch.registered = Some(id);
        }

        if let Some(to) = envelope.to.clone() {
            self.forward(connection, envelope, &to)?;
            dispatch.forwarded_to = Some(to);
        }

        Ok(dispatch)
    }

    /// Binary frames are accepted when they carry UTF-8 JSON.
    pub fn handle_binary(
        &self,
        connection: &mut Connection,
        data: &[u8],
    ) -> Result<Dispatch, RelayError> {
        let text = std::str::from_utf8(data).map_err(|err| {
            EnvelopeError::Malformed(format!("binary frame is not UTF-8: {err}"))
        })?;
        self.handle_text(connection, text)
    }

    fn forward(
        &self,
        connection: &Connection,
        envelope: Envelope,
        to: &SessionId,
    ) -> Result<(), RelayError> {
        let Some(recipient) = self.registry.lookup(to) else {
            return Err(RelayError::UnknownRecipient(to.clone()));
        };
        let kind = envelope.kind.as_str();
        // `from` is always the relay's view of the sender, never the client's claim.
        let from = self.owned_sender_id(connection);
        let outbound = envelope.with_from(from.clone());
        if recipient.send(outbound).is_err() {
            self.registry.remove_if_owned(to, recipient.id());
            return Err(RelayError::RecipientGone(to.clone()));
        }
        counter!("skiff_relay_envelopes_forwarded_total", 1, "type" => kind);
        debug!(
            kind,
            from = ?from,
            to = %to,
            recipient = %recipient.id(),
            "envelope forwarded"
        );
        Ok(())
    }

    /// The id this connection registered, while the registry still routes it here.
    fn owned_sender_id(&self, connection: &Connection) -> Option<SessionId> {
        let id = connection.sender_id.as_ref()?;
        match self.registry.lookup(id) {
            Some(owner) if owner.id() == connection.id() => Some(id.clone()),
            _ => {
                debug!(
                    session_id = %id,
                    connection = %connection.id(),
                    "sender no longer owns its session id, clearing from"
                );
                None
            }
        }
    }

    pub fn close_connection(&self, connection: Connection) -> Vec<SessionId> {
        let removed = self.registry.unregister_by_handle(&connection.handle);
        debug!(
            connection = %connection.id(),
            removed = removed.len(),
            "connection closed"
        );
        removed
    }

    /// Log and count a failed dispatch; the connection always carries on.
    pub fn record_drop(&self, connection: &Connection, err: &RelayError) {
        counter!("skiff_relay_envelopes_dropped_total", 1, "reason" => err.reason());
        match err {
            RelayError::Malformed(_) | RelayError::Registration(_) => warn!(
                connection = %connection.id(),
                error = %err,
                "dropping envelope"
            ),
            RelayError::UnknownRecipient(_) | RelayError::RecipientGone(_) => debug!(
                connection = %connection.id(),
                error = %err,
                "dropping envelope"
            ),
        }
    }
}
