//! Logical destinations.
//!
//! An [`Address`] names a queue and, optionally, the host it lives on. It is
//! parsed from `queue` or `queue@host` and is independent of any backend:
//! each transport decides how (and whether) the host part is used.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// A logical destination of the form `queue` or `queue@host`.
///
/// ```rust
/// use letterbox::Address;
///
/// let address = Address::parse("orders@broker1").unwrap();
/// assert_eq!(address.queue(), "orders");
/// assert_eq!(address.host(), Some("broker1"));
/// assert_eq!(address.to_string(), "orders@broker1");
///
/// assert_eq!(Address::parse("orders").unwrap().host(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    queue: String,
    host: Option<String>,
}

impl Address {
    /// Parse an address string.
    ///
    /// The string is split at the first `@`. Everything after it is the host;
    /// an empty host is treated as absent. The queue part must not be empty.
    pub fn parse(value: &str) -> Result<Self, AddressError> {
        let (queue, host) = match value.split_once('@') {
            Some((queue, host)) => (queue, Some(host).filter(|h| !h.is_empty())),
            None => (value, None),
        };

        if queue.is_empty() {
            return Err(AddressError {
                input: value.to_owned(),
            });
        }

        Ok(Self {
            queue: queue.to_owned(),
            host: host.map(str::to_owned),
        })
    }

    /// Queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Host the queue lives on, if one was given.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}@{}", self.queue, host),
            None => f.write_str(&self.queue),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// Returned when a string cannot be parsed into an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError {
    input: String,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid address {:?}: queue name is empty", self.input)
    }
}

impl std::error::Error for AddressError {}
