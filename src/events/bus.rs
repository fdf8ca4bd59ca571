//! # Event bus for broadcasting broker events.
//!
//! [`Bus`] is a wrapper around [`tokio::sync::broadcast`] that lets the
//! queue, worker pools, and the scheduler broadcast [`Event`]s to multiple
//! subscribers simultaneously.
//!
//! ## Key characteristics:
//! - **Broadcast semantics**: all active subscribers receive a clone of each event
//! - **Non-persistent**: events are lost if there are no active subscribers
//! - **Bounded capacity**: old events are dropped when the channel is full
//! - **Best-effort**: publishing never blocks or fails the operation that
//!   produced the event

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for broker events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity.
    ///
    /// When capacity is exceeded, the oldest unsent events are dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all active subscribers.
    ///
    /// If there are no active subscribers, the event is dropped silently.
    /// This is intentional: the broker operates fine without observers.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::now(EventKind::TaskSubmitted).with_task("task-1"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::TaskSubmitted);
        assert_eq!(ev.task.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = Bus::new(8);
        bus.publish(Event::now(EventKind::QueueDepth));
    }
}
