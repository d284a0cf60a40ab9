use uuid::Uuid;

use crate::{Address, Envelope, MappingError, MessageMapper, envelope::headers};

use super::{DeliveryMode, JmsMessage, JmsSession};

const DOT: &str = "_DOT_";
const HYPHEN: &str = "_HYPHEN_";

/// Identifiers the JMS message selector grammar reserves.
const SELECTOR_KEYWORDS: [&str; 11] = [
    "NULL", "TRUE", "FALSE", "NOT", "AND", "OR", "BETWEEN", "LIKE", "IN", "IS", "ESCAPE",
];

/// Maps envelopes onto JMS bytes messages.
///
/// ## Mapping
///
/// - `id` → `JMSMessageID`
/// - `ContentType` header → `JMSType`
/// - other headers → string properties, with `.` and `-` in keys encoded as
///   `_DOT_` and `_HYPHEN_` so they form valid JMS property names
/// - `time_to_be_received` → time-to-live
/// - `reply_to_address` → `JMSReplyTo`, a queue named after the full address
/// - `correlation_id` → `JMSCorrelationID`
/// - `recoverable` → `JMSDeliveryMode`
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveMqMessageMapper;

impl MessageMapper for ActiveMqMessageMapper {
    type Native = JmsMessage;
    type Session = dyn JmsSession;

    fn to_native(
        &self,
        envelope: &Envelope,
        session: &Self::Session,
    ) -> Result<JmsMessage, MappingError> {
        let mut message = session.create_bytes_message(&envelope.body);

        message.message_id = Some(envelope.id().to_owned());
        message.correlation_id = envelope.correlation_id.clone();
        message.time_to_live = envelope.time_to_be_received;
        message.reply_to = envelope
            .reply_to_address
            .as_ref()
            .map(|address| session.queue(&address.to_string()));
        message.delivery_mode = if envelope.recoverable {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::NonPersistent
        };

        for (key, value) in &envelope.headers {
            if key == headers::CONTENT_TYPE {
                message.jms_type = Some(value.clone());
                continue;
            }
            message.properties.insert(encode_key(key)?, value.clone());
        }

        Ok(message)
    }

    fn to_envelope(&self, native: &JmsMessage) -> Result<Envelope, MappingError> {
        let id = native
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut envelope = Envelope::with_id(id);
        envelope.body = native.body.clone();
        envelope.headers = native
            .properties
            .iter()
            .map(|(key, value)| (decode_key(key), value.clone()))
            .collect();

        if let Some(jms_type) = &native.jms_type {
            envelope
                .headers
                .insert(headers::CONTENT_TYPE.to_owned(), jms_type.clone());
        }

        if let Some(reply_to) = &native.reply_to {
            let address = Address::parse(&reply_to.physical_name)
                .map_err(|e| MappingError::new("JMSReplyTo", e.to_string()))?;
            envelope.reply_to_address = Some(address);
        }

        envelope.time_to_be_received = native.time_to_live;
        envelope.correlation_id = native.correlation_id.clone();
        envelope.recoverable = native.delivery_mode == DeliveryMode::Persistent;

        Ok(envelope)
    }
}

/// Encode a header key as a JMS property name.
///
/// The encoded name must be a Java identifier that is neither a selector
/// keyword nor in the `JMS` namespace, and it must decode back to `key`.
fn encode_key(key: &str) -> Result<String, MappingError> {
    let encoded = key.replace('.', DOT).replace('-', HYPHEN);

    if !is_java_identifier(&encoded) {
        return Err(MappingError::new(key, "not a valid JMS property name"));
    }
    if encoded.starts_with("JMS") {
        return Err(MappingError::new(key, "the JMS prefix is reserved"));
    }
    if SELECTOR_KEYWORDS
        .iter()
        .any(|keyword| keyword.eq_ignore_ascii_case(&encoded))
    {
        return Err(MappingError::new(key, "reserved by the message selector syntax"));
    }
    if decode_key(&encoded) != key {
        return Err(MappingError::new(
            key,
            format!("ambiguous with the {DOT} and {HYPHEN} encodings"),
        ));
    }

    Ok(encoded)
}

fn decode_key(key: &str) -> String {
    key.replace(HYPHEN, "-").replace(DOT, ".")
}

fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::{
        envelope::strategies,
        transport::{InMemoryBroker, activemq::JmsDestination},
    };

    fn session() -> InMemoryBroker<JmsMessage> {
        InMemoryBroker::default()
    }

    fn to_native(envelope: &Envelope) -> Result<JmsMessage, MappingError> {
        ActiveMqMessageMapper.to_native(envelope, &session())
    }

    #[test]
    fn dotted_and_hyphenated_keys_are_encoded() {
        let envelope = Envelope::builder()
            .with_header("Message.Intent", "Send")
            .with_header("Reply-Queue", "q")
            .build();

        let native = to_native(&envelope).unwrap();

        assert_eq!(native.properties["Message_DOT_Intent"], "Send");
        assert_eq!(native.properties["Reply_HYPHEN_Queue"], "q");
        assert_eq!(
            ActiveMqMessageMapper.to_envelope(&native).unwrap().headers,
            envelope.headers
        );
    }

    #[test]
    fn content_type_becomes_the_jms_type() {
        let envelope = Envelope::builder()
            .with_content_type("application/json")
            .build();

        let native = to_native(&envelope).unwrap();

        assert_eq!(native.jms_type.as_deref(), Some("application/json"));
        assert!(!native.properties.contains_key(headers::CONTENT_TYPE));
    }

    #[test]
    fn reply_address_keeps_its_host() {
        let address = Address::parse("replies@broker1").unwrap();
        let envelope = Envelope::builder().reply_to_address(address.clone()).build();

        let native = to_native(&envelope).unwrap();

        assert_eq!(
            native.reply_to,
            Some(JmsDestination {
                physical_name: "replies@broker1".to_owned()
            })
        );
        assert_eq!(
            ActiveMqMessageMapper
                .to_envelope(&native)
                .unwrap()
                .reply_to_address,
            Some(address)
        );
    }

    #[test]
    fn time_to_be_received_is_the_time_to_live() {
        let envelope = Envelope::builder()
            .time_to_be_received(Duration::from_secs(90))
            .recoverable(false)
            .build();

        let native = to_native(&envelope).unwrap();

        assert_eq!(native.time_to_live, Some(Duration::from_secs(90)));
        assert_eq!(native.delivery_mode, DeliveryMode::NonPersistent);
    }

    #[test]
    fn unrepresentable_keys_are_rejected() {
        for key in ["", "9lives", "has space", "JMSXGroupID", "between", "a_DOT_b"] {
            let envelope = Envelope::builder().with_header(key, "v").build();

            let err = to_native(&envelope).unwrap_err();

            assert_eq!(err.field(), key);
        }
    }

    #[test]
    fn decoding_undoes_encoding() {
        for key in ["a.b-c", "_x.", "$scope", "Ünïcode.Key"] {
            assert_eq!(decode_key(&encode_key(key).unwrap()), key);
        }
    }

    #[test]
    fn missing_message_id_gets_a_fresh_one() {
        let native = JmsMessage::default();

        let envelope = ActiveMqMessageMapper.to_envelope(&native).unwrap();

        assert!(Uuid::parse_str(envelope.id()).is_ok());
        assert!(envelope.recoverable);
    }

    #[test]
    fn zero_time_to_be_received_is_kept() {
        let envelope = Envelope::builder()
            .time_to_be_received(Duration::ZERO)
            .build();

        let native = to_native(&envelope).unwrap();

        assert_eq!(native.time_to_live, Some(Duration::ZERO));
    }

    fn jms_envelope() -> impl Strategy<Value = Envelope> {
        strategies::envelope(
            "[A-Za-z][A-Za-z0-9.-]{0,24}"
                .prop_filter("must be a JMS property name", |key| encode_key(key).is_ok()),
            "[a-z][a-z0-9.-]{0,16}(@[a-z0-9.]{1,16})?"
                .prop_map(|address| Address::parse(&address).unwrap()),
        )
    }

    proptest! {
        #[test]
        fn round_trip_preserves_any_envelope(envelope in jms_envelope()) {
            let native = to_native(&envelope).unwrap();

            prop_assert_eq!(ActiveMqMessageMapper.to_envelope(&native).unwrap(), envelope);
        }
    }
}
