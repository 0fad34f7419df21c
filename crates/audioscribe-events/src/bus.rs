//! The publish/subscribe bus.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::SystemEvent;

/// Callback invoked on the dispatch task for every published event.
pub type Subscriber = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Fan-out hub for [`SystemEvent`]s.
///
/// Cloning is cheap; all clones share the subscriber list and the dispatch
/// task. Must be created inside a tokio runtime (the dispatch task is
/// spawned on construction).
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<SystemEvent>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SystemEvent>();
        let subscribers: Arc<RwLock<Vec<Subscriber>>> = Arc::new(RwLock::new(Vec::new()));

        let dispatch_subs = Arc::clone(&subscribers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // Snapshot the list so a subscriber registering from inside
                // a callback cannot deadlock the dispatch loop.
                let subs: Vec<Subscriber> = dispatch_subs.read().iter().cloned().collect();
                for sub in subs {
                    sub(&event);
                }
            }
            debug!("event bus dispatch task stopped");
        });

        Self { tx, subscribers }
    }

    /// Register a callback for every future event.
    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().push(subscriber);
    }

    /// Convenience: receive events through an unbounded channel instead of a
    /// callback. Dropped receivers are detached on the next delivery.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<SystemEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(move |event: &SystemEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    /// Publish an event. Never blocks; if the dispatch task is gone the
    /// event is dropped with a warning.
    pub fn publish(&self, event: SystemEvent) {
        if self.tx.send(event).is_err() {
            warn!("event bus dispatch task is gone, dropping event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogMessage;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe_channel();
        let mut rx_b = bus.subscribe_channel();

        bus.publish(SystemEvent::LogMessage(LogMessage::new("info", "hello")));

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        for event in [a, b] {
            match event {
                SystemEvent::LogMessage(log) => assert_eq!(log.message, "hello"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn delivery_order_is_preserved_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_channel();

        for i in 0..5 {
            bus.publish(SystemEvent::LogMessage(LogMessage::new(
                "info",
                format!("msg-{i}"),
            )));
        }

        for i in 0..5 {
            match rx.recv().await.unwrap() {
                SystemEvent::LogMessage(log) => assert_eq!(log.message, format!("msg-{i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_stall_publishing() {
        let bus = EventBus::new();
        drop(bus.subscribe_channel());
        let mut rx = bus.subscribe_channel();

        bus.publish(SystemEvent::LogMessage(LogMessage::new("warn", "still alive")));
        assert!(rx.recv().await.is_some());
    }
}
