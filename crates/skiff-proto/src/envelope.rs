use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::SessionId;

/// Closed set of envelope types carried over the signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Register,
    Offer,
    Answer,
    Ice,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Register => "register",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::Ice => "ice",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("{kind} envelope is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Unit of exchange between endpoints. The payload is never interpreted
/// beyond the `userId` of a registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<SessionId>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: Value, to: Option<SessionId>) -> Self {
        Self {
            kind,
            payload,
            to,
            from: None,
        }
    }

    pub fn register(id: &SessionId) -> Self {
        Self::new(
            EnvelopeKind::Register,
            json!({ "userId": id.as_str() }),
            None,
        )
    }

    pub fn offer(to: SessionId, description: Value) -> Self {
        Self::new(EnvelopeKind::Offer, description, Some(to))
    }

    pub fn answer(to: SessionId, description: Value) -> Self {
        Self::new(EnvelopeKind::Answer, description, Some(to))
    }

    pub fn ice(to: SessionId, candidate: Value) -> Self {
        Self::new(EnvelopeKind::Ice, candidate, Some(to))
    }

    pub fn with_from(mut self, from: Option<SessionId>) -> Self {
        self.from = from;
        self
    }

    /// Parse and validate one wire message.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        let kind = self.kind.as_str();
        if self.payload.is_null() {
            return Err(EnvelopeError::MissingField {
                kind,
                field: "payload",
            });
        }
        match self.kind {
            EnvelopeKind::Register => {
                if self.registration_id().is_none() {
                    return Err(EnvelopeError::MissingField {
                        kind,
                        field: "payload.userId",
                    });
                }
            }
            EnvelopeKind::Offer | EnvelopeKind::Answer | EnvelopeKind::Ice => {
                if self.to.as_ref().map_or(true, SessionId::is_blank) {
                    return Err(EnvelopeError::MissingField { kind, field: "to" });
                }
            }
        }
        Ok(())
    }

    /// The id a `register` envelope claims, if present and non-empty.
    pub fn registration_id(&self) -> Option<SessionId> {
        if self.kind != EnvelopeKind::Register {
            return None;
        }
        self.payload
            .get("userId")
            .and_then(Value::as_str)
            .map(SessionId::from)
            .filter(|id| !id.is_blank())
    }

    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|err| EnvelopeError::Malformed(err.to_string()))
    }
}
