//! In-process publish/subscribe for received frames
//!
//! Subscribers register for a topic, either a single arbitration ID or [`Topic::Any`], and are
//! called in registration order for every frame published on that topic.

use std::sync::{Arc, Mutex};

use canmaster_common::{traits::AsyncCanReceiver, CanMessage};
use tokio::sync::mpsc;

/// A subscription topic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Frames with this arbitration ID
    Id(u32),
    /// Every frame
    Any,
}

/// A callback invoked with each frame published on its topic
pub type Handler = Arc<dyn Fn(&CanMessage) + Send + Sync>;

/// Identifies a subscription so that it can be removed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    topic: Topic,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Routes published frames to subscribers
#[derive(Default)]
pub struct MessageBus {
    state: Mutex<BusState>,
}

impl core::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl MessageBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a callback for a topic
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, topic, handler });
        id
    }

    /// Register a queue for a topic
    ///
    /// The subscription is removed when the returned [`BusReceiver`] is dropped.
    pub fn subscribe_channel(self: &Arc<Self>, topic: Topic) -> BusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(
            topic,
            Arc::new(move |msg: &CanMessage| {
                // The receiver may already be gone while its unsubscribe is pending
                let _ = tx.send(*msg);
            }),
        );
        BusReceiver {
            id,
            rx,
            bus: self.clone(),
        }
    }

    /// Remove a subscription
    ///
    /// Returns false if there was no such subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    /// The number of registered subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Deliver a frame to the subscribers of a single topic
    pub fn publish_topic(&self, topic: Topic, msg: &CanMessage) {
        // Handlers run outside the lock so they are free to subscribe or unsubscribe
        let handlers: Vec<Handler> = self
            .lock()
            .subscribers
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            handler(msg);
        }
    }

    /// Deliver a frame on its arbitration ID topic, then on the wildcard topic
    pub fn publish(&self, msg: &CanMessage) {
        self.publish_topic(Topic::Id(msg.arbitration_id()), msg);
        self.publish_topic(Topic::Any, msg);
    }
}

/// The receiving end of a channel subscription
#[derive(Debug)]
pub struct BusReceiver {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<CanMessage>,
    bus: Arc<MessageBus>,
}

/// Returned when the bus side of a [`BusReceiver`] is closed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusClosed;

impl BusReceiver {
    /// The subscription backing this receiver
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl AsyncCanReceiver for BusReceiver {
    type Error = BusClosed;

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.rx.try_recv().ok()
    }

    async fn recv(&mut self) -> Result<CanMessage, BusClosed> {
        self.rx.recv().await.ok_or(BusClosed)
    }
}

impl Drop for BusReceiver {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
