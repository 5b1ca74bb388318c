//! Signal publishing/subscription abstraction (mechanics only).
//!
//! Every scheduler entity (job, queue) owns one bus. Observers subscribe to the
//! bus of whatever they care about; a queue additionally relays the buses of
//! the jobs it runs onto its own, so one subscription sees everything.
//!
//! ## Delivery
//!
//! - **In-order per subscriber**: a subscriber sees messages in publish order.
//! - **Unbounded**: publishing never blocks and never drops for a live subscriber.
//! - **After mutation**: publishers emit only once their own state is consistent,
//!   so a subscriber reacting to a message observes the post-change state.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to a message stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics).
///
/// ```ignore
/// let mut sub = queue.subscribe();
/// while let Some(signal) = sub.recv().await {
///     tracing::info!(kind = signal.kind(), "observed");
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every message currently buffered.
    pub fn drain(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Transport-agnostic pub/sub abstraction.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
