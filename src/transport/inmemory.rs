use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, Notify},
    time::Instant,
};

use crate::NativeMessage;

/// In-memory broker for testing or local pipelines.
///
/// Stores native messages in named queues and plays the role of a broker
/// client for any backend whose native type it holds. It is useful for:
/// - Unit and integration testing of the mapping and delivery contract
/// - Simulating destination lookups, expiration and connection loss
///
/// Queues must be declared before use unless auto-creation is enabled,
/// mirroring a broker that does not create destinations on demand.
///
/// ## Type Parameters
///
/// - `N`: native message type held in the queues
pub struct InMemoryBroker<N> {
    state: Arc<Mutex<BrokerState<N>>>,
    auto_create: bool,
}

struct BrokerState<N> {
    queues: HashMap<String, StoredQueue<N>>,
    connected: bool,
}

struct StoredQueue<N> {
    messages: VecDeque<Stored<N>>,
    arrivals: Arc<Notify>,
}

impl<N> Default for StoredQueue<N> {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
            arrivals: Arc::new(Notify::new()),
        }
    }
}

struct Stored<N> {
    message: N,
    expires_at: Option<Instant>,
}

impl<N> BrokerState<N> {
    fn ensure_connected(&self) -> Result<(), InMemoryBrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(InMemoryBrokerError::disconnected())
        }
    }
}

impl<N> InMemoryBroker<N> {
    /// Create queues on first use instead of reporting them as missing.
    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    /// Declare a queue. Declaring an existing queue keeps its messages.
    pub async fn declare_queue(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.queues.entry(name.to_owned()).or_default();
    }

    /// Drop every message from a queue.
    pub async fn purge(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.queues.get_mut(name) {
            queue.messages.clear();
        }
    }

    /// Whether a queue has been declared.
    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    /// Number of messages waiting on a queue, expired ones included.
    pub async fn len(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map_or(0, |queue| queue.messages.len())
    }

    /// Simulate a lost connection: every operation fails until
    /// [`reconnect`](Self::reconnect) is called.
    pub async fn disconnect(&self) {
        self.state.lock().await.connected = false;
    }

    /// Restore a connection lost through [`disconnect`](Self::disconnect).
    pub async fn reconnect(&self) {
        self.state.lock().await.connected = true;
    }

    /// Look up a queue, creating it when auto-creation is enabled.
    pub async fn resolve_queue(&self, name: &str) -> Result<Option<String>, InMemoryBrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;

        if !state.queues.contains_key(name) {
            if !self.auto_create {
                tracing::debug!(queue = name, "Queue does not exist");
                return Ok(None);
            }
            tracing::debug!(queue = name, "Auto-creating queue");
            state.queues.insert(name.to_owned(), StoredQueue::default());
        }

        Ok(Some(name.to_owned()))
    }

    /// Append a message to a queue and wake one waiting consumer.
    #[tracing::instrument(skip(self, message))]
    pub async fn enqueue(&self, queue: &str, message: N) -> Result<(), InMemoryBrokerError>
    where
        N: NativeMessage,
    {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;

        let stored = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| InMemoryBrokerError::queue_not_found(queue))?;

        // A lifetime past the end of the clock's range never expires.
        let expires_at = message
            .time_to_live()
            .and_then(|ttl| Instant::now().checked_add(ttl));
        tracing::debug!(
            message_id = message.message_id(),
            ?expires_at,
            "Message sent to in-memory queue",
        );
        stored.messages.push_back(Stored {
            message,
            expires_at,
        });
        stored.arrivals.notify_one();
        Ok(())
    }

    /// Take the next unexpired message, waiting up to `timeout` for one to
    /// arrive.
    ///
    /// Expired messages are discarded as they are encountered. A waiter that
    /// times out leaves nothing registered on the queue.
    #[tracing::instrument(skip(self))]
    pub async fn dequeue(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<N>, InMemoryBrokerError> {
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let arrivals = {
                let mut state = self.state.lock().await;
                state.ensure_connected()?;

                let stored = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| InMemoryBrokerError::queue_not_found(queue))?;

                let now = Instant::now();
                while let Some(next) = stored.messages.pop_front() {
                    if next.expires_at.is_some_and(|at| at <= now) {
                        tracing::debug!("Discarding expired message");
                        continue;
                    }
                    return Ok(Some(next.message));
                }

                Arc::clone(&stored.arrivals)
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, arrivals.notified())
                        .await
                        .is_err()
                    {
                        return Ok(None);
                    }
                }
                None => arrivals.notified().await,
            }
        }
    }
}

impl<N> Clone for InMemoryBroker<N> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            auto_create: self.auto_create,
        }
    }
}

impl<N> Default for InMemoryBroker<N> {
    /// Create a connected broker with no queues.
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues: HashMap::new(),
                connected: true,
            })),
            auto_create: false,
        }
    }
}

/// Error type for `InMemoryBroker` operations.
#[derive(Debug)]
pub struct InMemoryBrokerError {
    kind: InMemoryBrokerErrorKind,
}

impl InMemoryBrokerError {
    fn disconnected() -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::Disconnected,
        }
    }

    fn queue_not_found(queue: &str) -> Self {
        Self {
            kind: InMemoryBrokerErrorKind::QueueNotFound(queue.to_owned()),
        }
    }
}

impl std::fmt::Display for InMemoryBrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryBrokerErrorKind::Disconnected => write!(f, "In-memory broker is disconnected"),
            InMemoryBrokerErrorKind::QueueNotFound(queue) => {
                write!(f, "Queue {queue} not found in in-memory broker")
            }
        }
    }
}

impl std::error::Error for InMemoryBrokerError {}

#[derive(Debug)]
enum InMemoryBrokerErrorKind {
    Disconnected,
    QueueNotFound(String),
}
