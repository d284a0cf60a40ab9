//! Transport abstractions and broker backends.
//!
//! This module defines how an [`Envelope`] travels to and from a broker
//! without the application depending on the broker's client API.
//!
//! The send path is built around Tower's `Service` abstraction, enabling
//! middleware composition (retries, timeouts, tracing) while the sender
//! itself never retries.
//!
//! ## Key components
//!
//! - [`BrokerClient`]: seam to a broker client library (resolve, publish, poll)
//! - [`MessageSender`]: maps an envelope and dispatches it through a client
//! - [`MessageReceiver`]: waits for a native message and correlates it by id
//! - [`Transport`]: public-facing wrapper implementing `tower::Service`
//! - [`TransportError`]: unified error type with tracing context
//!
//! ## Thread affinity
//!
//! Senders and receivers hold no shared mutable state of their own. Any
//! sharing happens inside the broker client, which decides how its native
//! session or channel may be used concurrently.

mod inmemory;

#[cfg(feature = "activemq")]
pub mod activemq;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tower::{Service, ServiceExt};
use tracing_error::SpanTrace;

use crate::{Address, Envelope, MappingError, MessageMapper, NativeMessage};

pub use inmemory::{InMemoryBroker, InMemoryBrokerError};

/// Seam to a broker client library.
///
/// A client owns the connection, session or channel lifecycle. The core only
/// asks it to resolve destinations, publish native messages and poll a
/// destination for the next one.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Native message type exchanged with the broker.
    type Native: NativeMessage;
    /// Context handed to the mapper to construct native objects.
    type Session: ?Sized;
    /// Resolved broker-side destination.
    type Destination: Send + Sync;
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Session used by the mapper to construct native messages.
    fn session(&self) -> &Self::Session;

    /// Resolve an address, returning `None` when the destination does not
    /// exist and will not be created by the broker.
    async fn resolve(&self, address: &Address) -> Result<Option<Self::Destination>, Self::Error>;

    /// Publish a native message to a resolved destination.
    async fn publish(
        &self,
        message: Self::Native,
        destination: &Self::Destination,
    ) -> Result<PublishOutcome, Self::Error>;

    /// Wait up to `timeout` for the next message on `destination`.
    ///
    /// Any consumer opened for the call must be released before returning,
    /// whatever the outcome.
    async fn poll(
        &self,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Self::Native>, Self::Error>;
}

/// What the broker did with a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The message was accepted for the destination.
    Delivered,
    /// The broker accepted the publish but could not route it to any queue.
    Unroutable,
}

/// Trait implemented by anything able to deliver an [`Envelope`] to an
/// [`Address`].
#[async_trait::async_trait]
pub trait Sender {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send an envelope to a logical address.
    async fn send(&mut self, envelope: Envelope, address: &Address) -> Result<(), Self::Error>;
}

/// Sends envelopes through a [`BrokerClient`], translating them with a
/// [`MessageMapper`].
#[derive(Debug, Clone)]
pub struct MessageSender<C, M> {
    client: C,
    mapper: M,
}

impl<C, M> MessageSender<C, M> {
    /// Create a sender publishing through `client`.
    pub fn new(client: C, mapper: M) -> Self {
        Self { client, mapper }
    }
}

#[async_trait::async_trait]
impl<C, M> Sender for MessageSender<C, M>
where
    C: BrokerClient,
    M: MessageMapper<Native = C::Native, Session = C::Session> + Send + Sync,
{
    type Error = TransportError;

    /// Map the envelope, resolve the address and publish.
    ///
    /// Mapping happens first so that an unrepresentable envelope fails
    /// before any network I/O.
    #[tracing::instrument(skip_all, fields(message_id = %envelope.id(), address = %address))]
    async fn send(&mut self, envelope: Envelope, address: &Address) -> Result<(), Self::Error> {
        let native = self
            .mapper
            .to_native(&envelope, self.client.session())
            .map_err(TransportError::mapping)?;

        let destination = self
            .client
            .resolve(address)
            .await
            .map_err(|e| TransportError::send_failure(e.into()))?
            .ok_or_else(|| TransportError::destination_not_found(address.to_string()))?;

        let outcome = self
            .client
            .publish(native, &destination)
            .await
            .map_err(|e| TransportError::send_failure(e.into()))?;

        match outcome {
            PublishOutcome::Delivered => {
                tracing::debug!("Message dispatched");
                Ok(())
            }
            PublishOutcome::Unroutable => {
                tracing::warn!("Broker returned the message as unroutable");
                Err(TransportError::destination_not_found(address.to_string()))
            }
        }
    }
}

/// Receives native messages through a [`BrokerClient`] and correlates them
/// with the envelope id the caller expects.
///
/// Each call goes `Idle -> Waiting -> Delivered | TimedOut`. A timeout is
/// always reported as [`TransportErrorKind::NoMessageAvailable`].
#[derive(Debug, Clone)]
pub struct MessageReceiver<C, M> {
    client: C,
    mapper: M,
}

impl<C, M> MessageReceiver<C, M>
where
    C: BrokerClient,
    M: MessageMapper<Native = C::Native>,
{
    /// Create a receiver polling through `client`.
    pub fn new(client: C, mapper: M) -> Self {
        Self { client, mapper }
    }

    /// Wait for the next native message on `destination`.
    ///
    /// When `expected_id` is given, a message carrying another identifier is
    /// reported as [`TransportErrorKind::UnexpectedMessage`] instead of being
    /// returned.
    #[tracing::instrument(skip(self), fields(state = "waiting"))]
    pub async fn consume(
        &self,
        destination: &str,
        timeout: Duration,
        expected_id: Option<&str>,
    ) -> Result<C::Native, TransportError> {
        let received = self
            .client
            .poll(destination, timeout)
            .await
            .map_err(|e| TransportError::receive(e.into()))?;

        let Some(native) = received else {
            tracing::Span::current().record("state", "timed_out");
            tracing::debug!("No message arrived before the timeout");
            return Err(TransportError::no_message_available(destination, timeout));
        };

        tracing::Span::current().record("state", "delivered");

        if let Some(expected) = expected_id {
            if native.message_id() != Some(expected) {
                let actual = native.message_id().map(str::to_owned);
                tracing::warn!(expected, ?actual, "Unexpected message on destination");
                return Err(TransportError::unexpected_message(expected, actual));
            }
        }

        Ok(native)
    }

    /// Consume the next message and convert it into an [`Envelope`].
    pub async fn receive(
        &self,
        destination: &str,
        timeout: Duration,
        expected_id: Option<&str>,
    ) -> Result<Envelope, TransportError> {
        let native = self.consume(destination, timeout, expected_id).await?;
        self.to_envelope(&native)
    }

    /// Convert an already consumed native message.
    pub fn to_envelope(&self, native: &C::Native) -> Result<Envelope, TransportError> {
        self.mapper
            .to_envelope(native)
            .map_err(TransportError::mapping)
    }
}

/// A send request: the envelope and where it should go.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub envelope: Envelope,
    pub address: Address,
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for sending envelopes. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`], keeping the kind of errors
///   raised by the sender itself
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(sender: D) -> Self {
        Self {
            service: SenderService::new(sender),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    ///
    /// Retry and dead-letter policies are expected to be supplied this way;
    /// the transport itself never retries.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_service(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_service(e.into()))?;
            Ok(())
        })
    }
}

impl<S> Transport<S> {
    /// Send an [`Envelope`] to an [`Address`] through the transport.
    ///
    /// This is a convenience method for users that do not need direct access
    /// to the `tower::Service` API.
    pub async fn send(&mut self, envelope: Envelope, address: Address) -> Result<(), TransportError>
    where
        S: Service<Outgoing> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        ServiceExt::<Outgoing>::ready(&mut service)
            .await
            .map_err(|e| TransportError::from_service(e.into()))?
            .call(Outgoing { envelope, address })
            .await
            .map_err(|e| TransportError::from_service(e.into()))?;
        Ok(())
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The envelope cannot be represented in the backend's native encoding,
    /// or a native message cannot be read back.
    Mapping(MappingError),
    /// The address does not correspond to any broker destination.
    DestinationNotFound { destination: String },
    /// The backend failed to transmit the message.
    SendFailure(tower::BoxError),
    /// Nothing was delivered before the timeout elapsed.
    NoMessageAvailable {
        destination: String,
        timeout: Duration,
    },
    /// A message was delivered but its identifier was not the expected one.
    UnexpectedMessage {
        expected: String,
        actual: Option<String>,
    },
    /// The backend failed while waiting for a message.
    Receive(tower::BoxError),
}

impl TransportError {
    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The envelope or native message could not be mapped.
    pub fn mapping(err: MappingError) -> Self {
        Self::new(TransportErrorKind::Mapping(err))
    }

    /// The destination does not exist on the broker.
    pub fn destination_not_found(destination: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DestinationNotFound {
            destination: destination.into(),
        })
    }

    /// The backend failed to transmit a message.
    pub fn send_failure(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::SendFailure(err))
    }

    /// Nothing arrived on `destination` within `timeout`.
    pub fn no_message_available(destination: impl Into<String>, timeout: Duration) -> Self {
        Self::new(TransportErrorKind::NoMessageAvailable {
            destination: destination.into(),
            timeout,
        })
    }

    /// A message other than the expected one was delivered.
    pub fn unexpected_message(expected: impl Into<String>, actual: Option<String>) -> Self {
        Self::new(TransportErrorKind::UnexpectedMessage {
            expected: expected.into(),
            actual,
        })
    }

    /// The backend failed while waiting for a message.
    pub fn receive(err: tower::BoxError) -> Self {
        Self::new(TransportErrorKind::Receive(err))
    }

    /// Errors coming out of a service stack keep their kind when they were
    /// raised by the sender; anything else counts as a send failure.
    fn from_service(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::send_failure(err),
        }
    }

    /// What went wrong.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Mapping(err) => {
                writeln!(f, "Mapping error: {}: {}", err.field(), err.reason())
            }
            TransportErrorKind::DestinationNotFound { destination } => {
                writeln!(f, "Destination not found: {destination}")
            }
            TransportErrorKind::SendFailure(err) => writeln!(f, "Send failure: {err}"),
            TransportErrorKind::NoMessageAvailable {
                destination,
                timeout,
            } => writeln!(f, "No message available on {destination} after {timeout:?}"),
            TransportErrorKind::UnexpectedMessage { expected, actual } => writeln!(
                f,
                "Unexpected message: expected id {expected}, found {}",
                actual.as_deref().unwrap_or("<none>")
            ),
            TransportErrorKind::Receive(err) => writeln!(f, "Receive error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Mapping(err) => Some(err),
            TransportErrorKind::SendFailure(err) | TransportErrorKind::Receive(err) => {
                Some(err.as_ref())
            }
            _ => None,
        }
    }
}

/// Tower service adapter for a [`Sender`].
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<D> Service<Outgoing> for SenderService<D>
where
    D: Sender + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Outgoing) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender
                .send(req.envelope, &req.address)
                .await
                .map_err(Into::into)?;
            Ok(())
        })
    }
}
