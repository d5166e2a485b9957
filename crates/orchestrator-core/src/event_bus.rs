//! Live Event Bus: in-process pub/sub keyed by run id (spec §4.6).
//!
//! Subscriber queues are bounded (spec §9 "Bounded fan-out"); a full queue
//! drops the event for that subscriber rather than blocking the publisher.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use agon_gateway_core::metrics;

/// Capacity of a single subscriber's event queue.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Lifecycle events the orchestrators publish (spec §6 event names).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveEvent {
    TurnStart { turn_number: u32 },
    TurnComplete { turn_number: u32 },
    CooldownStart { seconds: u64, next_turn: u32 },
    DebateComplete,
    NewComment { comment_id: Uuid },
    TopicClosed { reason: String },
    ViewerCount { count: usize },
    Ping,
}

impl LiveEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::TurnStart { .. } => "turn_start",
            LiveEvent::TurnComplete { .. } => "turn_complete",
            LiveEvent::CooldownStart { .. } => "cooldown_start",
            LiveEvent::DebateComplete => "debate_complete",
            LiveEvent::NewComment { .. } => "new_comment",
            LiveEvent::TopicClosed { .. } => "topic_closed",
            LiveEvent::ViewerCount { .. } => "viewer_count",
            LiveEvent::Ping => "ping",
        }
    }
}

/// Process-local pub/sub, non-durable (spec §3 "Live Event Bus state is
/// process-local and non-durable").
#[derive(Default)]
pub struct LiveEventBus {
    subscribers: RwLock<HashMap<Uuid, Vec<(Uuid, mpsc::Sender<LiveEvent>)>>>,
}

impl LiveEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `run_id`'s events, returning a subscriber id and the
    /// receiving half of a bounded channel. Broadcasts an updated
    /// `viewer_count` to every subscriber of this run, including the new one
    /// (spec §8 scenario 6 — `viewer_count` is the first event a subscriber
    /// sees).
    pub fn subscribe(&self, run_id: Uuid) -> (Uuid, mpsc::Receiver<LiveEvent>) {
        let subscriber_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

        self.subscribers
            .write()
            .entry(run_id)
            .or_default()
            .push((subscriber_id, tx));

        let count = self.viewer_count(run_id);
        self.publish(run_id, LiveEvent::ViewerCount { count });

        (subscriber_id, rx)
    }

    /// Removes a subscriber, reaps the run's key if no subscribers remain,
    /// and otherwise broadcasts the updated `viewer_count` to those left.
    pub fn unsubscribe(&self, run_id: Uuid, subscriber_id: Uuid) {
        let reaped = {
            let mut subscribers = self.subscribers.write();
            match subscribers.get_mut(&run_id) {
                Some(list) => {
                    list.retain(|(id, _)| *id != subscriber_id);
                    if list.is_empty() {
                        subscribers.remove(&run_id);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        };
        if !reaped {
            let count = self.viewer_count(run_id);
            self.publish(run_id, LiveEvent::ViewerCount { count });
        }
    }

    /// Non-blocking offer into each subscriber's queue for `run_id`; drops
    /// and logs a warning on a full queue rather than blocking the caller.
    pub fn publish(&self, run_id: Uuid, event: LiveEvent) {
        let subscribers = self.subscribers.read();
        let Some(list) = subscribers.get(&run_id) else {
            return;
        };

        let event_name = event.name();
        for (subscriber_id, tx) in list {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!(
                    %run_id,
                    %subscriber_id,
                    event = event_name,
                    "subscriber queue full, dropping event"
                );
                if let Some(counter) = metrics::EVENT_BUS_DROPS.get() {
                    counter.with_label_values(&[event_name]).inc();
                }
            }
        }
    }

    #[must_use]
    pub fn viewer_count(&self, run_id: Uuid) -> usize {
        self.subscribers.read().get(&run_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_delivers_to_subscriber() {
        let bus = LiveEventBus::new();
        let run_id = Uuid::new_v4();
        let (_id, mut rx) = bus.subscribe(run_id);

        let first = rx.recv().await.expect("should receive subscribe's own viewer_count");
        assert_eq!(first.name(), "viewer_count");

        bus.publish(run_id, LiveEvent::TurnStart { turn_number: 1 });

        let received = rx.recv().await.expect("should receive event");
        assert_eq!(received.name(), "turn_start");
    }

    #[tokio::test]
    async fn test_unsubscribe_reaps_empty_key() {
        let bus = LiveEventBus::new();
        let run_id = Uuid::new_v4();
        let (subscriber_id, _rx) = bus.subscribe(run_id);

        assert_eq!(bus.viewer_count(run_id), 1);
        bus.unsubscribe(run_id, subscriber_id);
        assert_eq!(bus.viewer_count(run_id), 0);
        assert!(!bus.subscribers.read().contains_key(&run_id));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_run_is_a_noop() {
        let bus = LiveEventBus::new();
        bus.publish(Uuid::new_v4(), LiveEvent::Ping);
    }

    #[tokio::test]
    async fn test_viewer_count_reflects_multiple_subscribers() {
        let bus = LiveEventBus::new();
        let run_id = Uuid::new_v4();
        let (_a, _rx_a) = bus.subscribe(run_id);
        let (_b, _rx_b) = bus.subscribe(run_id);

        assert_eq!(bus.viewer_count(run_id), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let bus = LiveEventBus::new();
        let run_id = Uuid::new_v4();
        let (_id, mut rx) = bus.subscribe(run_id);

        for _ in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish(run_id, LiveEvent::Ping);
        }

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= SUBSCRIBER_QUEUE_CAPACITY);
    }
}
