// Copyright (c) 2024 Botho Foundation

//! A shared broadcast bus for cross-subsystem events (connection
//! established/closed, stream opened, relay reservation changes).
//!
//! `subscribe()` hands out a lazy, effectively infinite sequence of events
//! in emission order. On `shutdown()` every live subscription terminates
//! cleanly — but the bus itself keeps working: a subsequent `subscribe()`
//! allocates a fresh broadcaster and sees later emissions, rather than
//! handing out a receiver on a channel that will never deliver again.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default channel capacity when none is given explicitly.
const DEFAULT_CAPACITY: usize = 256;

/// A multi-producer, multi-consumer event bus.
pub struct EventBus<T: Clone + Send + 'static> {
    sender: Arc<RwLock<broadcast::Sender<T>>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Create a bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose internal channel holds up to `capacity` unread
    /// events per subscriber before the oldest are dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(RwLock::new(sender)),
            capacity,
        }
    }

    /// Subscribe to future events.
    ///
    /// No events emitted before this call are delivered, and none are
    /// missed between this call returning and the first `recv` on the
    /// receiver it hands back.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.read().subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event was delivered to. This
    /// is a best-effort count: a subscriber's queue may still fill and drop
    /// it before it is read.
    pub fn publish(&self, event: T) -> usize {
        self.sender.read().send(event).unwrap_or(0)
    }

    /// Terminate every live subscription, then reset the bus so future
    /// `subscribe`/`publish` calls work normally again.
    pub fn shutdown(&self) {
        let (fresh, _) = broadcast::channel(self.capacity);
        *self.sender.write() = fresh;
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_event_reaches_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(42);
        assert_eq!(rx.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus: EventBus<&'static str> = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish("hi");
        assert_eq!(a.recv().await.unwrap(), "hi");
        assert_eq!(b.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn shutdown_terminates_existing_subscription() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.shutdown();
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_sees_later_emissions() {
        let bus: EventBus<u32> = EventBus::new();
        let mut stale = bus.subscribe();
        bus.shutdown();
        assert!(stale.recv().await.is_err());

        let mut fresh = bus.subscribe();
        bus.publish(7);
        assert_eq!(fresh.recv().await.unwrap(), 7);
    }
}
