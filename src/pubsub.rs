//! Topic-keyed broadcast fabric for element-scoped diffs.
//!
//! Topics are strings: the well-known [`ANNOUNCE`] topic carries root-group
//! create/delete events, every other topic is an element id. Publishing is
//! asynchronous: diffs go through an unbounded queue drained by a single
//! delivery thread, which preserves publish order per topic and keeps slow
//! subscribers from ever blocking a publisher. Subscriber channels are
//! unbounded for the same reason.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::channel::{self, Sender};
use crate::graph::element::{ElementId, Position};

/// The topic carrying root-group lifecycle events.
pub const ANNOUNCE: &str = "/announce";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    Subscribe,
    Create,
    Delete,
    UpdateValue,
    UpdatePosition,
    UpdateAlias,
    UpdateGroupRouteAlias,
    UpdateGroupRouteHidden,
    Translate,
    RootGroupCreate,
    RootGroupDelete,
}

/// One incremental change, scoped to the topic it is published on. Only the
/// fields relevant to the action are set.
#[derive(Debug, Clone, Serialize)]
pub struct Diff {
    pub action: DiffAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ElementId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<ElementId>,
}

impl Diff {
    pub fn new(action: DiffAction) -> Diff {
        Diff {
            action,
            id: None,
            data: None,
            alias: None,
            position: None,
            value: None,
            hidden: None,
            route: None,
        }
    }
}

/// Identifies one subscription, for unsubscribing.
pub type SubscriptionId = u64;

type TopicTable = FxHashMap<String, Vec<(SubscriptionId, Sender<Diff>)>>;

pub struct PubSub {
    topics: Arc<Mutex<TopicTable>>,
    publish_tx: Sender<(String, Diff)>,
    next_subscription: AtomicU64,
}

impl PubSub {
    pub fn new() -> PubSub {
        let topics: Arc<Mutex<TopicTable>> = Arc::new(Mutex::new(FxHashMap::default()));
        let (publish_tx, publish_rx) = channel::unbounded::<(String, Diff)>();

        let delivery_topics = Arc::clone(&topics);
        std::thread::Builder::new()
            .name("pubsub".to_owned())
            .spawn(move || {
                while let Ok((topic, diff)) = publish_rx.recv() {
                    let mut table = delivery_topics.lock();
                    if let Some(subscribers) = table.get_mut(&topic) {
                        subscribers.retain(|(_, tx)| tx.send(diff.clone()).is_ok());
                    }
                }
                debug!("pubsub delivery stopped");
            })
            .unwrap();

        PubSub {
            topics,
            publish_tx,
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Fan a diff out to the topic's subscribers. Never blocks.
    pub fn publish(&self, topic: &str, diff: Diff) {
        let _ = self.publish_tx.send((topic.to_owned(), diff));
    }

    /// Register a subscriber on a topic. `seed` runs before the subscriber
    /// can receive any published diff, so the acknowledgement and initial
    /// `create` payload always precede later updates on the channel.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber: Sender<Diff>,
        seed: impl FnOnce(&Sender<Diff>),
    ) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let mut table = self.topics.lock();
        seed(&subscriber);
        table
            .entry(topic.to_owned())
            .or_default()
            .push((id, subscriber));
        id
    }

    /// Drop one subscription. Publishers are unaffected; diffs already queued
    /// for delivery may still arrive on the channel.
    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        let mut table = self.topics.lock();
        for subscribers in table.values_mut() {
            subscribers.retain(|(id, _)| *id != subscription);
        }
    }

    pub fn unsubscribe_all(&self, subscriptions: &[SubscriptionId]) {
        let mut table = self.topics.lock();
        for subscribers in table.values_mut() {
            subscribers.retain(|(id, _)| !subscriptions.contains(id));
        }
    }
}

impl Default for PubSub {
    fn default() -> Self {
        PubSub::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn publish_preserves_order_per_topic() {
        let pubsub = PubSub::new();
        let (tx, rx) = channel::unbounded();
        pubsub.subscribe("a", tx, |_| {});

        for i in 0..10 {
            let mut diff = Diff::new(DiffAction::Create);
            diff.id = Some(ElementId::from(i));
            pubsub.publish("a", diff);
        }

        for i in 0..10u64 {
            let diff = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(diff.id, Some(ElementId::from(i)));
        }
    }

    #[test]
    fn seed_precedes_later_publishes() {
        let pubsub = PubSub::new();
        let (tx, rx) = channel::unbounded();
        pubsub.subscribe("a", tx, |tx| {
            let _ = tx.send(Diff::new(DiffAction::Subscribe));
        });
        pubsub.publish("a", Diff::new(DiffAction::Create));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().action,
            DiffAction::Subscribe
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap().action,
            DiffAction::Create
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let pubsub = PubSub::new();
        let (tx, rx) = channel::unbounded();
        let sub = pubsub.subscribe("a", tx, |_| {});
        pubsub.unsubscribe(sub);
        pubsub.publish("a", Diff::new(DiffAction::Create));

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
