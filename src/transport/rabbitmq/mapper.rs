use std::time::Duration;

use lapin::{
    BasicProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use uuid::Uuid;

use crate::{Address, Envelope, MappingError, MessageMapper, envelope::headers};

use super::AmqpMessage;

/// AMQP short strings are length-prefixed by a single byte.
const SHORT_STRING_MAX: usize = 255;

const TRANSIENT: u8 = 1;
const PERSISTENT: u8 = 2;

/// Maps envelopes onto AMQP basic properties.
///
/// ## Mapping
///
/// - `id` → `message_id`
/// - `ContentType` header → `content_type` (not repeated in the header table)
/// - other headers → AMQP header table, as long strings
/// - `time_to_be_received` → `expiration`, total milliseconds in base 10
/// - `reply_to_address` → `reply_to`, queue name only
/// - `correlation_id` → `correlation_id`
/// - `recoverable` → `delivery_mode` (2 persistent, 1 transient)
///
/// The host part of the reply address is not carried: AMQP reply-to is a
/// flat queue name, so it comes back without a host.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpMessageMapper;

impl MessageMapper for AmqpMessageMapper {
    type Native = AmqpMessage;
    type Session = ();

    fn to_native(&self, envelope: &Envelope, _session: &()) -> Result<AmqpMessage, MappingError> {
        let delivery_mode = if envelope.recoverable {
            PERSISTENT
        } else {
            TRANSIENT
        };
        let mut properties = BasicProperties::default()
            .with_message_id(short_string("message_id", envelope.id())?)
            .with_delivery_mode(delivery_mode);

        let mut table = FieldTable::default();
        for (key, value) in &envelope.headers {
            if key == headers::CONTENT_TYPE {
                properties = properties.with_content_type(short_string(key, value)?);
                continue;
            }
            table.insert(
                short_string(key, key)?,
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        if let Some(ttl) = envelope.time_to_be_received {
            let millis = u64::try_from(ttl.as_millis()).map_err(|_| {
                MappingError::new(
                    "expiration",
                    format!("{ttl:?} exceeds the largest expiration in milliseconds"),
                )
            })?;
            properties =
                properties.with_expiration(short_string("expiration", &millis.to_string())?);
        }

        if let Some(reply_to) = &envelope.reply_to_address {
            properties = properties.with_reply_to(short_string("reply_to", reply_to.queue())?);
        }

        if let Some(correlation_id) = &envelope.correlation_id {
            properties =
                properties.with_correlation_id(short_string("correlation_id", correlation_id)?);
        }

        Ok(AmqpMessage {
            properties: properties.with_headers(table),
            body: envelope.body.clone(),
        })
    }

    fn to_envelope(&self, native: &AmqpMessage) -> Result<Envelope, MappingError> {
        let properties = &native.properties;

        let id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut envelope = Envelope::with_id(id);
        envelope.body = native.body.clone();

        if let Some(table) = properties.headers() {
            for (key, value) in table.inner() {
                let key = key.as_str();
                envelope
                    .headers
                    .insert(key.to_owned(), header_value(key, value)?);
            }
        }

        if let Some(content_type) = properties.content_type() {
            envelope.headers.insert(
                headers::CONTENT_TYPE.to_owned(),
                content_type.as_str().to_owned(),
            );
        }

        if let Some(expiration) = properties.expiration() {
            let millis: u64 = expiration.as_str().parse().map_err(|_| {
                MappingError::new(
                    "expiration",
                    format!("{:?} is not a whole number of milliseconds", expiration.as_str()),
                )
            })?;
            envelope.time_to_be_received = Some(Duration::from_millis(millis));
        }

        if let Some(reply_to) = properties.reply_to() {
            let address = Address::parse(reply_to.as_str())
                .map_err(|e| MappingError::new("reply_to", e.to_string()))?;
            envelope.reply_to_address = Some(address);
        }

        envelope.correlation_id = properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned());
        envelope.recoverable = *properties.delivery_mode() != Some(TRANSIENT);

        Ok(envelope)
    }
}

fn short_string(field: &str, value: &str) -> Result<ShortString, MappingError> {
    if value.len() > SHORT_STRING_MAX {
        return Err(MappingError::new(
            field,
            format!(
                "{} bytes exceed the AMQP short string limit of {SHORT_STRING_MAX}",
                value.len()
            ),
        ));
    }
    Ok(ShortString::from(value.to_owned()))
}

/// Header values written by other producers may be any AMQP type; only
/// strings and scalars have a faithful string form.
fn header_value(key: &str, value: &AMQPValue) -> Result<String, MappingError> {
    let text = match value {
        AMQPValue::LongString(s) => String::from_utf8(s.as_bytes().to_vec())
            .map_err(|_| MappingError::new(key, "header value is not valid UTF-8"))?,
        AMQPValue::ShortString(s) => s.as_str().to_owned(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortShortInt(n) => n.to_string(),
        AMQPValue::ShortShortUInt(n) => n.to_string(),
        AMQPValue::ShortInt(n) => n.to_string(),
        AMQPValue::ShortUInt(n) => n.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongUInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        other => {
            return Err(MappingError::new(
                key,
                format!("unsupported header value {other:?}"),
            ));
        }
    };
    Ok(text)
}
