use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use serde::Serialize;
use skiff_proto::{Envelope, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identity of one accepted socket. Handles compare by this id only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of a live connection as seen by the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Envelope>,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        tx: mpsc::UnboundedSender<Envelope>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id,
            tx,
            remote_addr,
            connected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queue an envelope for the connection's writer. Fire-and-forget: the
    /// only failure is a writer that has already gone away.
    pub fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.tx.send(envelope).map_err(|err| err.0)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// What happens when a second connection registers an id that is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Last registration wins.
    #[default]
    Replace,
    /// Keep the existing live owner and refuse the newcomer.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Refreshed,
    Replaced { previous: ConnectionId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id {0} is already registered by another connection")]
    IdInUse(SessionId),
    #[error("session id must not be blank")]
    BlankId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub remote_addr: Option<String>,
    pub connected_at: i64,
}

/// SessionId -> connection mapping shared by every connection task.
pub struct Registry {
    entries: DashMap<SessionId, ConnectionHandle>,
    policy: CollisionPolicy,
}

impl Registry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    pub fn register(
        &self,
        id: SessionId,
        handle: ConnectionHandle,
    ) -> Result<Registration, RegistryError> {
        if id.is_blank() {
            return Err(RegistryError::BlankId);
        }
        let outcome = match self.entries.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.id() == handle.id() {
                    entry.insert(handle);
                    Registration::Refreshed
                } else if self.policy == CollisionPolicy::Reject && !current.is_closed() {
                    return Err(RegistryError::IdInUse(id));
                } else {
                    let previous = entry.insert(handle);
                    Registration::Replaced {
                        previous: previous.id(),
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Registration::Created
            }
        };
        self.publish_size();
        Ok(outcome)
    }

    pub fn lookup(&self, id: &SessionId) -> Option<ConnectionHandle> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Drop every id owned by `handle`'s connection and return them.
    pub fn unregister_by_handle(&self, handle: &ConnectionHandle) -> Vec<SessionId> {
        let mut removed = Vec::new();
        self.entries.retain(|id, entry| {
            if entry.id() == handle.id() {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.publish_size();
        }
        removed
    }

    /// Remove `id` only while it still points at `connection`.
    pub fn remove_if_owned(&self, id: &SessionId, connection: ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(id, |_, entry| entry.id() == connection)
            .is_some();
        if removed {
            self.publish_size();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .entries
            .iter()
            .map(|entry| RegistryEntry {
                session_id: entry.key().clone(),
                connection_id: entry.value().id(),
                remote_addr: entry.value().remote_addr().map(|addr| addr.to_string()),
                connected_at: entry.value().connected_at.timestamp(),
            })
            .collect();
        entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        entries
    }

    fn publish_size(&self) {
        gauge!("skiff_relay_registered_ids", self.entries.len() as f64);
    }
}
