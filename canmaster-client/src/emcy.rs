//! Per node emergency message consumer

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use canmaster_common::{emcy::EmcyError, CanMessage, NodeId};
use tokio::sync::broadcast;

use crate::bus::{MessageBus, SubscriptionId, Topic};

const EVENT_CHANNEL_SIZE: usize = 32;

/// An emergency received from a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmcyEvent {
    /// The arbitration ID the emergency was received on
    pub cob_id: u32,
    /// The decoded emergency
    pub error: EmcyError,
}

/// A callback invoked for each received emergency
pub type EmcyCallback = Arc<dyn Fn(&EmcyEvent) + Send + Sync>;

#[derive(Default)]
struct EmcyState {
    log: Vec<EmcyError>,
    active: Vec<EmcyError>,
    callbacks: Vec<EmcyCallback>,
}

struct EmcyInner {
    node_id: NodeId,
    state: Mutex<EmcyState>,
    events: broadcast::Sender<EmcyEvent>,
    subscription: Mutex<Option<SubscriptionId>>,
}

/// Collects the emergency messages sent by one node
#[derive(Clone)]
pub struct EmcyConsumer {
    inner: Arc<EmcyInner>,
}

impl core::fmt::Debug for EmcyConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state();
        f.debug_struct("EmcyConsumer")
            .field("node_id", &self.inner.node_id)
            .field("log", &state.log)
            .field("active", &state.active)
            .finish()
    }
}

impl EmcyConsumer {
    pub(crate) fn new(node_id: NodeId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(EmcyInner {
                node_id,
                state: Mutex::new(EmcyState::default()),
                events,
                subscription: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EmcyState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every emergency received since the last reset
    pub fn log(&self) -> Vec<EmcyError> {
        self.state().log.clone()
    }

    /// Emergencies received since the node last reported an error reset
    pub fn active(&self) -> Vec<EmcyError> {
        self.state().active.clone()
    }

    /// Clear the log and the active list
    pub fn reset(&self) {
        let mut state = self.state();
        state.log.clear();
        state.active.clear();
    }

    /// Register a callback for received emergencies
    pub fn add_callback(&self, callback: EmcyCallback) {
        self.state().callbacks.push(callback);
    }

    /// Get a receiver for emergency events
    pub fn subscribe(&self) -> broadcast::Receiver<EmcyEvent> {
        self.inner.events.subscribe()
    }

    /// Process an emergency frame from the node
    pub fn on_emergency(&self, msg: &CanMessage) {
        let Some(error) = EmcyError::from_bytes(msg.data(), msg.timestamp()) else {
            log::warn!(
                "Node {}: ignoring short EMCY frame {:02X?}",
                self.inner.node_id,
                msg.data()
            );
            return;
        };
        log::debug!("Node {}: EMCY {error}", self.inner.node_id);

        let callbacks = {
            let mut state = self.state();
            state.log.push(error);
            if error.is_reset() {
                state.active.clear();
            } else {
                state.active.push(error);
            }
            state.callbacks.clone()
        };

        let event = EmcyEvent {
            cob_id: msg.arbitration_id(),
            error,
        };
        for callback in callbacks {
            callback(&event);
        }
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn listen(&self, bus: &MessageBus) {
        let weak: Weak<EmcyInner> = Arc::downgrade(&self.inner);
        let id = bus.subscribe(
            Topic::Id(self.inner.node_id.emcy_id().raw()),
            Arc::new(move |msg: &CanMessage| {
                if let Some(inner) = weak.upgrade() {
                    EmcyConsumer { inner }.on_emergency(msg);
                }
            }),
        );
        let old = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(id);
        if let Some(old) = old {
            bus.unsubscribe(old);
        }
    }

    pub(crate) fn unlisten(&self, bus: &MessageBus) {
        let id = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = id {
            bus.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use canmaster_common::CanId;

    use super::*;

    fn emcy(data: &[u8]) -> CanMessage {
        CanMessage::new(CanId::std(0x85), data).with_timestamp(3)
    }

    #[test]
    fn test_log_and_active() {
        let consumer = EmcyConsumer::new(NodeId::new(5).unwrap());
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        consumer.add_callback(Arc::new(move |e: &EmcyEvent| {
            s.store(e.cob_id, Ordering::Relaxed);
        }));

        consumer.on_emergency(&emcy(&[0x10, 0x42, 0x08, 0, 0, 0, 0, 0]));
        assert_eq!(0x85, seen.load(Ordering::Relaxed));
        assert_eq!(1, consumer.active().len());
        assert_eq!(Some("Temperature"), consumer.active()[0].description());
        assert_eq!(3, consumer.log()[0].timestamp);

        consumer.on_emergency(&emcy(&[0x00, 0x00, 0x00, 0, 0, 0, 0, 0]));
        assert!(consumer.active().is_empty());
        assert_eq!(2, consumer.log().len());

        consumer.reset();
        assert!(consumer.log().is_empty());
    }

    #[test]
    fn test_short_frame_ignored() {
        let consumer = EmcyConsumer::new(NodeId::new(5).unwrap());
        let mut rx = consumer.subscribe();
        consumer.on_emergency(&emcy(&[0x10]));
        assert!(consumer.log().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
