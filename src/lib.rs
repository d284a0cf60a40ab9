#![doc = include_str!("../README.md")]

pub mod address;
pub mod envelope;
pub mod mapper;
pub mod transport;

#[doc(inline)]
pub use address::{Address, AddressError};

#[doc(inline)]
pub use envelope::{Envelope, EnvelopeBuilder};

#[doc(inline)]
pub use mapper::{MappingError, MessageMapper, NativeMessage};

#[doc(inline)]
pub use transport::{
    BrokerClient, InMemoryBroker, MessageReceiver, MessageSender, Sender, Transport,
    TransportError, TransportErrorKind,
};
