//! Wire protocol shared by the skiff relay and its endpoints.
//! Kept dependency-light so the relay never has to link the media stack.

mod envelope;
mod id;

pub use envelope::{Envelope, EnvelopeError, EnvelopeKind};
pub use id::SessionId;
