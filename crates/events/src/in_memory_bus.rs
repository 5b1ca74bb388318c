//! In-memory signal bus.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    Poisoned,
}

type RelayFn<M> = Box<dyn Fn(M) -> bool + Send + Sync>;

enum Sink<M> {
    Channel(mpsc::UnboundedSender<M>),
    /// Synchronous forwarder; returning `false` detaches it.
    Relay(RelayFn<M>),
}

impl<M> Sink<M> {
    fn deliver(&self, message: M) -> bool {
        match self {
            Sink::Channel(tx) => tx.send(message).is_ok(),
            Sink::Relay(f) => f(message),
        }
    }
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Fan-out to channels and synchronous relays, in registration order
/// - Dead subscribers are dropped while publishing
pub struct InMemoryEventBus<M> {
    sinks: Mutex<Vec<Sink<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous relay invoked for each published message.
    ///
    /// Relays run inside `publish`, so forwarding into another bus keeps the
    /// publisher's ordering. A relay must not touch this same bus.
    pub fn relay<F>(&self, f: F)
    where
        F: Fn(M) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(Sink::Relay(Box::new(f)));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }
}

impl<M> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut sinks = self.sinks.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let before = sinks.len();
        sinks.retain(|sink| sink.deliver(message.clone()));
        if sinks.len() < before {
            tracing::trace!(dropped = before - sinks.len(), "detached dead subscribers");
        }

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages.
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.push(Sink::Channel(tx));
        }

        Subscription::new(rx)
    }
}
