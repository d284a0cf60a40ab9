use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use lapin::{
    Channel, Connection,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::FieldTable,
};
use tokio::{
    sync::Mutex,
    time::{self, Instant},
};
use tokio_stream::StreamExt as _;

use crate::{
    Address,
    transport::{BrokerClient, PublishOutcome},
};

use super::AmqpMessage;

/// Live RabbitMQ client backed by `lapin`.
///
/// ## Design
///
/// - Messages are published to a **single exchange** (the default exchange
///   unless [`with_exchange`](Self::with_exchange) is used), with the queue
///   name as routing key
/// - Publishes are `mandatory` and confirmed, so an unroutable message is
///   reported instead of silently dropped
/// - Destination lookups and polls each use a short-lived channel, closed on
///   every exit path
///
/// The publishing channel is wrapped in `Arc<Mutex<_>>` because:
/// - publishes and their confirmations must not interleave
/// - `Sender::send` is async and may be called concurrently
#[derive(Clone)]
pub struct LapinClient {
    /// Connection used to open short-lived channels.
    connection: Arc<Connection>,
    /// Shared AMQP channel used for publishing.
    channel: Arc<Mutex<Channel>>,
    /// Target exchange name.
    exchange: String,
}

impl LapinClient {
    /// Open a publishing channel on `connection` with publisher confirms
    /// enabled.
    #[tracing::instrument(skip_all)]
    pub async fn new(connection: Arc<Connection>) -> Result<Self, lapin::Error> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
            exchange: String::new(),
        })
    }

    /// Publish through a named exchange instead of the default one.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }
}

#[async_trait]
impl BrokerClient for LapinClient {
    type Native = AmqpMessage;
    type Session = ();
    type Destination = String;
    type Error = tower::BoxError;

    fn session(&self) -> &() {
        &()
    }

    /// Check the queue with a passive declare. RabbitMQ answers a missing
    /// queue with `NOT_FOUND` and closes the channel.
    #[tracing::instrument(skip(self), fields(queue = address.queue()))]
    async fn resolve(&self, address: &Address) -> Result<Option<String>, Self::Error> {
        let channel = self.connection.create_channel().await?;
        let declared = channel
            .queue_declare(
                address.queue(),
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        close(&channel).await;

        match declared {
            Ok(_) => Ok(Some(address.queue().to_owned())),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip(self, message), fields(exchange = %self.exchange))]
    async fn publish(
        &self,
        message: AmqpMessage,
        routing_key: &String,
    ) -> Result<PublishOutcome, Self::Error> {
        let channel = self.channel.lock().await;
        let confirmation = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &message.body,
                message.properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(Some(returned)) => {
                tracing::debug!(
                    reply_code = returned.reply_code,
                    reply_text = returned.reply_text.as_str(),
                    "Message returned by the broker",
                );
                Ok(PublishOutcome::Unroutable)
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(PublishOutcome::Delivered),
            Confirmation::Nack(_) => Err("message was nacked by the broker".into()),
        }
    }

    /// Every step, from opening the channel to the delivery, counts against
    /// `timeout`.
    #[tracing::instrument(skip(self))]
    async fn poll(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<AmqpMessage>, Self::Error> {
        let started = Instant::now();

        let channel = match time::timeout(timeout, self.connection.create_channel()).await {
            Err(_) => return Ok(None),
            Ok(channel) => channel?,
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        let received = match time::timeout(remaining, consume_one(&channel, queue)).await {
            Err(_) => Ok(None),
            Ok(received) => received,
        };
        close(&channel).await;
        received
    }
}

/// Take one delivery from `queue`, waiting until one arrives. With a
/// prefetch of one, nothing else is held by this consumer when its channel
/// closes.
async fn consume_one(channel: &Channel, queue: &str) -> Result<Option<AmqpMessage>, tower::BoxError> {
    channel.basic_qos(1, BasicQosOptions::default()).await?;
    let mut consumer = channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let delivery = match consumer.next().await {
        None => return Err("consumer was cancelled by the broker".into()),
        Some(delivery) => delivery?,
    };
    delivery.ack(BasicAckOptions::default()).await?;

    Ok(Some(AmqpMessage {
        properties: delivery.properties,
        body: delivery.data,
    }))
}

async fn close(channel: &Channel) {
    if let Err(error) = channel.close(200, "OK").await {
        tracing::debug!(?error, "Channel was already closed");
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(e) => {
            matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        _ => false,
    }
}
