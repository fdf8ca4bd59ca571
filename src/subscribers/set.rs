//! # Subscriber pumps: per-observer delivery off the event bus.
//!
//! [`SubscriberSet`] gives every subscriber its own receiver on the
//! broadcast [`Bus`] and a pump fiber that filters, delivers, and isolates
//! failures. There is no intermediate queue: the bus itself is the buffer,
//! and a subscriber that cannot keep up lags on its own receiver without
//! slowing the publisher or its siblings.
//!
//! ## Architecture
//! ```text
//! Bus (broadcast, capacity N)
//!  ├─► receiver ── pump 1 ── kinds() filter ── subscriber1.on_event()
//!  ├─► receiver ── pump 2 ── kinds() filter ── subscriber2.on_event()
//!  └─► receiver ── pump M ── kinds() filter ── subscriberM.on_event()
//! ```
//!
//! ## Rules
//! - Publishing stays non-blocking: the bus send never waits on a pump
//! - A lagging receiver skips the oldest events; the miss count is logged
//!   against that subscriber only
//! - A panic inside `on_event` is caught and logged; the pump moves on to
//!   the next event
//! - Pumps run until [`close`](SubscriberSet::close) fires their stop
//!   token or the bus shuts down

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::events::{Bus, Event};
use crate::subscribers::Subscribe;

/// Owns one pump fiber per subscriber, all fed from the same bus.
pub struct SubscriberSet {
    stop: CancellationToken,
    pumps: JoinSet<()>,
}

impl SubscriberSet {
    /// Subscribes every observer to the bus and starts its pump.
    ///
    /// Each pump sees only events published after this call.
    pub fn attach(bus: &Bus, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        let stop = CancellationToken::new();
        let mut pumps = JoinSet::new();

        for subscriber in subscribers {
            let events = bus.subscribe();
            let token = stop.clone();
            pumps.spawn(pump(subscriber, events, token));
        }

        Self { stop, pumps }
    }

    /// Number of attached subscribers still being pumped.
    pub fn len(&self) -> usize {
        self.pumps.len()
    }

    /// True when no subscribers are attached.
    pub fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    /// Stops all pumps and waits for them to finish.
    ///
    /// Events still buffered on individual receivers are dropped; the
    /// publishers are unaffected.
    pub async fn close(mut self) {
        self.stop.cancel();
        while self.pumps.join_next().await.is_some() {}
    }
}

/// Drives one subscriber: receive, filter by interest, deliver, isolate.
async fn pump(
    subscriber: Arc<dyn Subscribe>,
    mut events: broadcast::Receiver<Event>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        subscriber = subscriber.name(),
                        missed, "subscriber fell behind; oldest events dropped"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let interests = subscriber.kinds();
        if !interests.is_empty() && !interests.contains(&event.kind) {
            continue;
        }

        let delivery = std::panic::AssertUnwindSafe(subscriber.on_event(&event)).catch_unwind();
        if delivery.await.is_err() {
            error!(
                subscriber = subscriber.name(),
                kind = ?event.kind,
                "subscriber panicked while handling event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter {
        seen: Arc<AtomicUsize>,
        interests: Vec<EventKind>,
    }

    #[async_trait]
    impl Subscribe for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn kinds(&self) -> &[EventKind] {
            &self.interests
        }
        async fn on_event(&self, _event: &Event) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploder;

    #[async_trait]
    impl Subscribe for Exploder {
        fn name(&self) -> &'static str {
            "exploder"
        }
        async fn on_event(&self, _event: &Event) {
            panic!("kaboom");
        }
    }

    fn counter(interests: Vec<EventKind>) -> (Arc<AtomicUsize>, Arc<Counter>) {
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = Arc::new(Counter {
            seen: seen.clone(),
            interests,
        });
        (seen, sub)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = Bus::new(16);
        let (a_seen, a) = counter(vec![]);
        let (b_seen, b) = counter(vec![]);
        let set = SubscriberSet::attach(&bus, vec![a, b]);
        assert_eq!(set.len(), 2);

        bus.publish(Event::now(EventKind::TaskSubmitted));
        bus.publish(Event::now(EventKind::TaskCompleted));
        settle().await;
        set.close().await;

        assert_eq!(a_seen.load(Ordering::SeqCst), 2);
        assert_eq!(b_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn interest_filter_narrows_delivery() {
        let bus = Bus::new(16);
        let (seen, sub) = counter(vec![EventKind::TaskFailed, EventKind::TaskRetrying]);
        let set = SubscriberSet::attach(&bus, vec![sub]);

        bus.publish(Event::now(EventKind::TaskSubmitted));
        bus.publish(Event::now(EventKind::TaskFailed));
        bus.publish(Event::now(EventKind::TaskRetrying));
        bus.publish(Event::now(EventKind::TaskCompleted));
        settle().await;
        set.close().await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_affect_others() {
        let bus = Bus::new(16);
        let (seen, sub) = counter(vec![]);
        let set = SubscriberSet::attach(&bus, vec![Arc::new(Exploder), sub]);

        bus.publish(Event::now(EventKind::TaskFailed));
        bus.publish(Event::now(EventKind::TaskCompleted));
        settle().await;
        set.close().await;

        // The exploder panicked on both events; the counter saw both.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_stops_pumps_promptly() {
        let bus = Bus::new(16);
        let (seen, sub) = counter(vec![]);
        let set = SubscriberSet::attach(&bus, vec![sub]);
        set.close().await;

        bus.publish(Event::now(EventKind::TaskSubmitted));
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
