use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Address;

/// Well-known header keys.
pub mod headers {
    /// Carried in the native content-type property rather than the header bag.
    pub const CONTENT_TYPE: &str = "ContentType";
}

/// Broker-agnostic message container exchanged with the application.
///
/// `Envelope` bundles an opaque body with string headers and the delivery
/// options every backend understands. Transports translate it to and from
/// their native message through a [`MessageMapper`](crate::MessageMapper).
///
/// ## Identity
///
/// The `id` is fixed at construction and is the only key used to correlate a
/// sent envelope with the native message later observed on a destination.
///
/// ## Example
///
/// ```rust
/// use std::time::Duration;
/// use letterbox::{Address, Envelope};
///
/// let envelope = Envelope::builder()
///     .with_body(b"<TestMessage/>".to_vec())
///     .with_content_type("application/xml")
///     .time_to_be_received(Duration::from_secs(60))
///     .reply_to_address(Address::parse("replies@broker1").unwrap())
///     .build();
///
/// assert_eq!(envelope.content_type(), Some("application/xml"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    /// Message payload, never interpreted by the transports.
    pub body: Vec<u8>,
    /// Message metadata, kept sorted by key.
    pub headers: BTreeMap<String, String>,
    /// Where a correlated reply should be sent.
    pub reply_to_address: Option<Address>,
    /// How long the message stays eligible for delivery after it is sent.
    pub time_to_be_received: Option<Duration>,
    /// Identifier of the conversation this message belongs to.
    pub correlation_id: Option<String>,
    /// Whether the broker should persist the message.
    pub recoverable: bool,
}

impl Envelope {
    /// Create an empty envelope with a fresh identifier.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create an empty envelope with a caller-chosen identifier.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: Vec::new(),
            headers: BTreeMap::new(),
            reply_to_address: None,
            time_to_be_received: None,
            correlation_id: None,
            recoverable: true,
        }
    }

    /// Start building an envelope with a fresh identifier.
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder {
            envelope: Self::new(),
        }
    }

    /// Identifier used for correlation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Value of the [`headers::CONTENT_TYPE`] header, if set.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(headers::CONTENT_TYPE).map(String::as_str)
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

/// Step-by-step construction of an [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    /// Replace the generated identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.envelope.id = id.into();
        self
    }

    /// Set the payload.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.envelope.body = body.into();
        self
    }

    /// Add or replace a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envelope.headers.insert(key.into(), value.into());
        self
    }

    /// Set the [`headers::CONTENT_TYPE`] header.
    pub fn with_content_type(self, content_type: impl Into<String>) -> Self {
        self.with_header(headers::CONTENT_TYPE, content_type)
    }

    /// Expire the message once `ttl` has elapsed after sending.
    pub fn time_to_be_received(mut self, ttl: Duration) -> Self {
        self.envelope.time_to_be_received = Some(ttl);
        self
    }

    /// Address replies should be sent to.
    pub fn reply_to_address(mut self, address: Address) -> Self {
        self.envelope.reply_to_address = Some(address);
        self
    }

    /// Tie the message to a conversation.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.envelope.correlation_id = Some(correlation_id.into());
        self
    }

    /// Ask the broker to persist the message, or not.
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.envelope.recoverable = recoverable;
        self
    }

    /// Finish building.
    pub fn build(self) -> Envelope {
        self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelopes_get_distinct_ids() {
        let a = Envelope::new();
        let b = Envelope::new();

        assert!(!a.id().is_empty());
        assert_ne!(a.id(), b.id());
        assert!(a.recoverable);
    }

    #[test]
    fn builder_populates_every_field() {
        let envelope = Envelope::builder()
            .with_id("msg-1")
            .with_body("hello")
            .with_content_type("application/json")
            .with_header("EnclosedMessageTypes", "Ping")
            .time_to_be_received(Duration::from_secs(5))
            .reply_to_address(Address::parse("replies").unwrap())
            .correlation_id("conv-9")
            .recoverable(false)
            .build();

        assert_eq!(envelope.id(), "msg-1");
        assert_eq!(envelope.body, b"hello");
        assert_eq!(envelope.content_type(), Some("application/json"));
        assert_eq!(envelope.headers.len(), 2);
        assert_eq!(envelope.time_to_be_received, Some(Duration::from_secs(5)));
        assert_eq!(envelope.reply_to_address.as_ref().unwrap().queue(), "replies");
        assert_eq!(envelope.correlation_id.as_deref(), Some("conv-9"));
        assert!(!envelope.recoverable);
    }

    #[test]
    fn survives_json_persistence() {
        let envelope = Envelope::builder()
            .with_body(vec![0, 159, 146, 150])
            .reply_to_address(Address::parse("replies@broker2").unwrap())
            .build();

        let json = serde_json::to_string(&envelope).unwrap();
        let restored: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, envelope);
    }
}

#[cfg(test)]
pub(crate) mod strategies {
    use proptest::{collection, option, prelude::*};

    use super::*;

    /// Envelopes with header keys drawn from `keys` and reply addresses
    /// drawn from `reply_to`. Lifetimes are whole milliseconds.
    pub(crate) fn envelope(
        keys: impl Strategy<Value = String>,
        reply_to: impl Strategy<Value = Address>,
    ) -> impl Strategy<Value = Envelope> {
        (
            "[A-Za-z0-9-]{1,40}",
            collection::vec(any::<u8>(), 0..64),
            collection::btree_map(keys, "\\PC{0,16}", 0..6),
            option::of(any::<u64>().prop_map(Duration::from_millis)),
            option::of(reply_to),
            option::of("[A-Za-z0-9-]{1,36}"),
            any::<bool>(),
        )
            .prop_map(
                |(id, body, headers, time_to_be_received, reply_to_address, correlation_id, recoverable)| {
                    Envelope {
                        id,
                        body,
                        headers,
                        reply_to_address,
                        time_to_be_received,
                        correlation_id,
                        recoverable,
                    }
                },
            )
    }
}
