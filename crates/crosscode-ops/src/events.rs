use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::bridge::Subscription;
use crate::topic::Topic;

/// In-process fan-out of channel payloads.
///
/// Every subscriber gets its own unbounded queue, so a slow reader never
/// drops events and never delays other readers. Events emitted on a topic
/// with no subscribers are discarded. Subscribers are keyed by channel name,
/// so `Topic::Named("build-output")` and `Topic::BuildOutput` are one channel.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    released: AtomicU64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .lock()
            .entry(topic.channel_name())
            .or_default()
            .push(Subscriber { id, tx });
        trace!(%topic, id, "subscribed");

        let bus: Weak<BusInner> = Arc::downgrade(&self.inner);
        let key = topic.channel_name();
        Subscription::new(topic, rx, move || {
            if let Some(bus) = bus.upgrade() {
                bus.remove(&key, id);
            }
        })
    }

    /// Delivers `payload` to every current subscriber of `topic` and returns
    /// how many received it.
    pub fn emit(&self, topic: &Topic, payload: Value) -> usize {
        let key = topic.channel_name();
        let mut topics = self.inner.topics.lock();
        let Some(subscribers) = topics.get_mut(&key) else {
            trace!(%topic, "no subscribers; event dropped");
            return 0;
        };
        subscribers.retain(|sub| sub.tx.send(payload.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            topics.remove(&key);
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .lock()
            .get(&topic.channel_name())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Total subscriptions released through this bus.
    pub fn released_count(&self) -> u64 {
        self.inner.released.load(Ordering::Relaxed)
    }
}

impl BusInner {
    fn remove(&self, channel: &str, id: u64) {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(channel) else {
            return;
        };
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        if subscribers.len() < before {
            self.released.fetch_add(1, Ordering::Relaxed);
            trace!(channel, id, "unsubscribed");
        }
        if subscribers.is_empty() {
            topics.remove(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn delivers_in_emission_order_to_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(Topic::BuildOutput);
        let mut b = bus.subscribe(Topic::BuildOutput);

        for i in 0..5 {
            assert_eq!(bus.emit(&Topic::BuildOutput, Value::from(i)), 2);
        }

        let got_a: Vec<Value> = (&mut a).take(5).collect().await;
        let got_b: Vec<Value> = (&mut b).take(5).collect().await;
        let expected: Vec<Value> = (0..5).map(Value::from).collect();
        assert_eq!(got_a, expected);
        assert_eq!(got_b, expected);
    }

    #[tokio::test]
    async fn events_before_subscribe_are_lost() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(&Topic::Devices, Value::from("early")), 0);
        let mut sub = bus.subscribe(Topic::Devices);
        bus.emit(&Topic::Devices, Value::from("late"));
        assert_eq!(sub.recv().await, Some(Value::from("late")));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut syslog = bus.subscribe(Topic::Syslog);
        bus.emit(&Topic::Stdout, Value::from("stdout"));
        bus.emit(&Topic::Syslog, Value::from("syslog"));
        assert_eq!(syslog.recv().await, Some(Value::from("syslog")));
        assert_eq!(syslog.try_recv(), None);
    }

    #[tokio::test]
    async fn release_removes_subscriber_once() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::Devices);
        let _other = bus.subscribe(Topic::Devices);
        assert_eq!(bus.subscriber_count(&Topic::Devices), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);

        assert_eq!(bus.subscriber_count(&Topic::Devices), 1);
        assert_eq!(bus.released_count(), 1);
        assert_eq!(bus.emit(&Topic::Devices, Value::Null), 1);
    }

    #[tokio::test]
    async fn unsubscribe_after_bus_dropped_is_safe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Topic::Stdout);
        drop(bus);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn named_spelling_reaches_the_same_channel() {
        let bus = EventBus::new();
        let mut output = bus.subscribe(Topic::BuildOutput);
        let token = crate::topic::InvocationToken::new();
        let mut steps = bus.subscribe(Topic::operation("deploy", token));

        assert_eq!(bus.emit(&Topic::Named("build-output".into()), Value::from("line")), 1);
        let raw = format!("operation_deploy/{token}");
        assert_eq!(bus.emit(&Topic::Named(raw.clone()), Value::from("step")), 1);

        assert_eq!(output.recv().await, Some(Value::from("line")));
        assert_eq!(steps.recv().await, Some(Value::from("step")));
        assert_eq!(bus.subscriber_count(&Topic::Named(raw)), 1);

        output.unsubscribe();
        assert_eq!(bus.subscriber_count(&Topic::Named("build-output".into())), 0);
    }
}
