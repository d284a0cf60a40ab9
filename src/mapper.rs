//! Translation between [`Envelope`]s and broker-native messages.
//!
//! Every backend owns a [`MessageMapper`]. It is the only component that
//! builds or reads native message properties, so property names, encodings
//! and reserved headers never leak into the sender or receiver.

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::Envelope;

/// Bidirectional, per-backend translation of messages.
///
/// Implementations must be deterministic and must not perform I/O beyond
/// constructing native objects through the supplied session.
pub trait MessageMapper {
    /// Backend-native message type.
    type Native;
    /// Context needed to construct native messages and destinations.
    type Session: ?Sized;

    /// Build a native message from an envelope.
    fn to_native(
        &self,
        envelope: &Envelope,
        session: &Self::Session,
    ) -> Result<Self::Native, MappingError>;

    /// Rebuild an envelope from a native message.
    fn to_envelope(&self, native: &Self::Native) -> Result<Envelope, MappingError>;
}

/// Properties the transports need to read from a native message without
/// going through a full mapping.
pub trait NativeMessage: Send {
    /// Message identifier, used for correlation.
    fn message_id(&self) -> Option<&str>;

    /// Remaining lifetime requested by the producer, if any.
    fn time_to_live(&self) -> Option<Duration>;
}

/// An envelope field that cannot be represented in the native encoding, or
/// a native property that cannot be read back into an envelope.
#[derive(Debug)]
pub struct MappingError {
    context: SpanTrace,
    field: String,
    reason: String,
}

impl MappingError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field or header.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cannot map {}: {}", self.field, self.reason)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for MappingError {}
