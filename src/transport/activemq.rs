//! ActiveMQ backend.
//!
//! Envelopes travel as JMS-style bytes messages: the standard `JMS*` header
//! fields carry id, correlation, type, reply destination, time-to-live and
//! delivery mode, and every other header becomes a message property.
//!
//! There is no JMS client for Rust, so the native message model lives here
//! and a client library plugs in through [`JmsSession`] and
//! [`BrokerClient`].

mod mapper;

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;

use crate::{
    Address, NativeMessage,
    transport::{
        BrokerClient, InMemoryBroker, InMemoryBrokerError, MessageReceiver, MessageSender,
        PublishOutcome,
    },
};

pub use mapper::ActiveMqMessageMapper;

/// Sender publishing envelopes as JMS messages.
pub type ActiveMqSender<C> = MessageSender<C, ActiveMqMessageMapper>;

/// Receiver consuming JMS messages.
pub type ActiveMqReceiver<C> = MessageReceiver<C, ActiveMqMessageMapper>;

/// JMS delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// Reference to a JMS queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JmsDestination {
    pub physical_name: String,
}

/// Native JMS bytes message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JmsMessage {
    /// `JMSMessageID`
    pub message_id: Option<String>,
    /// `JMSCorrelationID`
    pub correlation_id: Option<String>,
    /// `JMSType`
    pub jms_type: Option<String>,
    /// `JMSReplyTo`
    pub reply_to: Option<JmsDestination>,
    /// Time-to-live set on send. `None` means the message never expires; a
    /// client library translating the JMS convention of a zero time-to-live
    /// maps it to `None`.
    pub time_to_live: Option<Duration>,
    /// `JMSDeliveryMode`
    pub delivery_mode: DeliveryMode,
    /// Application properties.
    pub properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl NativeMessage for JmsMessage {
    fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }
}

/// Factory for native JMS objects, provided by the client library.
pub trait JmsSession: Send + Sync {
    fn create_bytes_message(&self, body: &[u8]) -> JmsMessage;

    fn queue(&self, physical_name: &str) -> JmsDestination;
}

impl JmsSession for InMemoryBroker<JmsMessage> {
    fn create_bytes_message(&self, body: &[u8]) -> JmsMessage {
        JmsMessage {
            body: body.to_vec(),
            ..JmsMessage::default()
        }
    }

    fn queue(&self, physical_name: &str) -> JmsDestination {
        JmsDestination {
            physical_name: physical_name.to_owned(),
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker<JmsMessage> {
    type Native = JmsMessage;
    type Session = dyn JmsSession;
    type Destination = JmsDestination;
    type Error = InMemoryBrokerError;

    fn session(&self) -> &Self::Session {
        self
    }

    async fn resolve(&self, address: &Address) -> Result<Option<JmsDestination>, Self::Error> {
        let queue = self.resolve_queue(address.queue()).await?;
        Ok(queue.map(|name| self.queue(&name)))
    }

    async fn publish(
        &self,
        message: JmsMessage,
        destination: &JmsDestination,
    ) -> Result<PublishOutcome, Self::Error> {
        self.enqueue(&destination.physical_name, message).await?;
        Ok(PublishOutcome::Delivered)
    }

    async fn poll(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<JmsMessage>, Self::Error> {
        self.dequeue(queue, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Envelope,
        transport::{Sender, TransportErrorKind},
    };

    const TEST_QUEUE: &str = "testendpoint";
    const WAIT: Duration = Duration::from_millis(1000);

    async fn setup() -> (
        ActiveMqSender<InMemoryBroker<JmsMessage>>,
        ActiveMqReceiver<InMemoryBroker<JmsMessage>>,
    ) {
        let broker = InMemoryBroker::<JmsMessage>::default();
        broker.declare_queue(TEST_QUEUE).await;
        (
            MessageSender::new(broker.clone(), ActiveMqMessageMapper),
            MessageReceiver::new(broker, ActiveMqMessageMapper),
        )
    }

    #[tokio::test]
    async fn received_envelope_matches_the_sent_one() {
        let (mut sender, receiver) = setup().await;
        let envelope = Envelope::builder()
            .with_body(b"<TestMessage/>".to_vec())
            .with_content_type("application/xml")
            .with_header("Originating.Host-Name", "web-01")
            .time_to_be_received(Duration::from_secs(60))
            .reply_to_address(Address::parse("replies@broker1").unwrap())
            .correlation_id("c-1")
            .recoverable(false)
            .build();

        sender
            .send(envelope.clone(), &Address::parse("testendpoint@localhost").unwrap())
            .await
            .unwrap();
        let received = receiver
            .receive(TEST_QUEUE, WAIT, Some(envelope.id()))
            .await
            .unwrap();

        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn native_fields_carry_the_reserved_headers() {
        let (mut sender, receiver) = setup().await;
        let envelope = Envelope::builder()
            .with_content_type("application/json")
            .time_to_be_received(Duration::from_secs(24 * 60 * 60))
            .build();
        let id = envelope.id().to_owned();

        sender
            .send(envelope, &Address::parse(TEST_QUEUE).unwrap())
            .await
            .unwrap();
        let native = receiver.consume(TEST_QUEUE, WAIT, Some(&id)).await.unwrap();

        assert_eq!(native.message_id.as_deref(), Some(id.as_str()));
        assert_eq!(native.jms_type.as_deref(), Some("application/json"));
        assert_eq!(native.time_to_live, Some(Duration::from_secs(24 * 60 * 60)));
        assert!(native.properties.is_empty());
    }

    #[tokio::test]
    async fn sending_to_a_missing_queue_fails() {
        let (mut sender, _) = setup().await;

        let err = sender
            .send(
                Envelope::new(),
                &Address::parse("NonExistingQueue@localhost").unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err.kind(),
            TransportErrorKind::DestinationNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_property_names_fail_before_sending() {
        let (mut sender, receiver) = setup().await;
        let envelope = Envelope::builder().with_header("has space", "x").build();

        let err = sender
            .send(envelope, &Address::parse(TEST_QUEUE).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), TransportErrorKind::Mapping(e) if e.field() == "has space"));
        assert!(matches!(
            receiver
                .consume(TEST_QUEUE, Duration::from_millis(10), None)
                .await
                .unwrap_err()
                .kind(),
            TransportErrorKind::NoMessageAvailable { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_time_to_be_received_expires_immediately() {
        let (mut sender, receiver) = setup().await;
        let envelope = Envelope::builder()
            .time_to_be_received(Duration::ZERO)
            .build();

        sender
            .send(envelope, &Address::parse(TEST_QUEUE).unwrap())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(60 * 60)).await;

        let err = receiver.consume(TEST_QUEUE, WAIT, None).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            TransportErrorKind::NoMessageAvailable { .. }
        ));
    }

    #[tokio::test]
    async fn time_to_be_received_beyond_the_clock_range_never_expires() {
        let (mut sender, receiver) = setup().await;
        let envelope = Envelope::builder()
            .time_to_be_received(Duration::MAX)
            .build();
        let id = envelope.id().to_owned();

        sender
            .send(envelope, &Address::parse(TEST_QUEUE).unwrap())
            .await
            .unwrap();
        let native = receiver.consume(TEST_QUEUE, WAIT, Some(&id)).await.unwrap();

        assert_eq!(native.time_to_live, Some(Duration::MAX));
    }
}
