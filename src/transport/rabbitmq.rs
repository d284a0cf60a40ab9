//! RabbitMQ backend.
//!
//! Envelopes travel as AMQP messages: metadata in basic properties and the
//! header table, the body as the raw payload. Destinations are queues reached
//! through an exchange (the default exchange unless configured otherwise),
//! with the queue name as routing key.

mod client;
mod mapper;

use std::time::Duration;

use async_trait::async_trait;
use lapin::{BasicProperties, types::ShortString};

use crate::{
    Address, NativeMessage,
    transport::{
        BrokerClient, InMemoryBroker, InMemoryBrokerError, MessageReceiver, MessageSender,
        PublishOutcome,
    },
};

pub use client::LapinClient;
pub use mapper::AmqpMessageMapper;

/// Sender publishing envelopes as AMQP messages.
pub type RabbitMqSender<C> = MessageSender<C, AmqpMessageMapper>;

/// Receiver consuming AMQP messages.
pub type RabbitMqReceiver<C> = MessageReceiver<C, AmqpMessageMapper>;

/// Native AMQP message: basic properties plus the raw body.
#[derive(Debug, Clone)]
pub struct AmqpMessage {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl NativeMessage for AmqpMessage {
    fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(ShortString::as_str)
    }

    fn time_to_live(&self) -> Option<Duration> {
        self.properties
            .expiration()
            .as_ref()
            .and_then(|expiration| expiration.as_str().parse().ok())
            .map(Duration::from_millis)
    }
}

/// The in-memory broker stands in for a RabbitMQ channel. The host part of
/// an address is ignored, as it is on a single RabbitMQ broker.
#[async_trait]
impl BrokerClient for InMemoryBroker<AmqpMessage> {
    type Native = AmqpMessage;
    type Session = ();
    type Destination = String;
    type Error = InMemoryBrokerError;

    fn session(&self) -> &() {
        &()
    }

    async fn resolve(&self, address: &Address) -> Result<Option<String>, Self::Error> {
        self.resolve_queue(address.queue()).await
    }

    async fn publish(
        &self,
        message: AmqpMessage,
        queue: &String,
    ) -> Result<PublishOutcome, Self::Error> {
        self.enqueue(queue, message).await?;
        Ok(PublishOutcome::Delivered)
    }

    async fn poll(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<AmqpMessage>, Self::Error> {
        self.dequeue(queue, timeout).await
    }
}
