//! Per-topic subscriber registry for pushed messages.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::types::{PushMessage, PushTopic};

/// Callback invoked for every message on a subscribed topic.
pub type PushCallback = Arc<dyn Fn(&PushMessage) + Send + Sync>;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Internal subscription state.
struct Registered {
    id: SubscriptionId,
    callback: PushCallback,
}

/// Holds subscribers and fans messages out to them.
///
/// Callbacks for a topic run in registration order.
pub struct SubscriptionRegistry {
    /// Subscribers by topic, in registration order.
    topics: RwLock<HashMap<PushTopic, Vec<Registered>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for `topic`.
    pub fn subscribe(self: &Arc<Self>, topic: PushTopic, callback: PushCallback) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.topics
            .write()
            .entry(topic)
            .or_default()
            .push(Registered { id, callback });

        tracing::trace!(topic = %topic, id = id.0, "Push subscriber added");

        Subscription {
            id,
            topic,
            registry: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Remove a subscriber. Returns whether it was present.
    pub fn remove(&self, topic: PushTopic, id: SubscriptionId) -> bool {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(&topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(&topic);
        }
        removed
    }

    /// Deliver a message to every subscriber of its topic.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. Returns the number of callbacks invoked.
    pub fn dispatch(&self, message: &PushMessage) -> usize {
        let callbacks: Vec<PushCallback> = {
            let topics = self.topics.read();
            match topics.get(&message.topic) {
                Some(subscribers) => subscribers.iter().map(|s| Arc::clone(&s.callback)).collect(),
                None => return 0,
            }
        };

        for callback in &callbacks {
            callback(message);
        }
        callbacks.len()
    }

    /// Number of subscribers on `topic`.
    pub fn subscriber_count(&self, topic: PushTopic) -> usize {
        self.topics.read().get(&topic).map_or(0, Vec::len)
    }

    /// Number of subscribers across all topics.
    pub fn total_count(&self) -> usize {
        self.topics.read().values().map(Vec::len).sum()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for removing a subscription.
///
/// `unsubscribe` may be called any number of times, including after the
/// channel disconnected or was dropped. Dropping the handle unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    topic: PushTopic,
    registry: Weak<SubscriptionRegistry>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> PushTopic {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.topic, self.id);
            tracing::trace!(topic = %self.topic, id = self.id.0, "Push subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}
