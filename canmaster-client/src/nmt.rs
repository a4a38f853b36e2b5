//! Per node NMT state tracking

use std::{
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use canmaster_common::{
    messages::NMT_CMD_ID,
    nmt::{InvalidNmtCommandError, NmtCommand, NmtState},
    CanMessage, NodeId,
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tokio::sync::broadcast;

use crate::{
    bus::{MessageBus, SubscriptionId, Topic},
    config::NmtConfig,
    network::NetworkLink,
};

const EVENT_CHANNEL_SIZE: usize = 32;

/// Errors from NMT operations
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum NmtError {
    /// The requested target state name is not known
    #[snafu(display("{source}"))]
    InvalidState {
        /// The parse error
        source: InvalidNmtCommandError,
    },
    /// The command could not be sent
    #[snafu(display("Failed to send NMT command: {message}"))]
    SendFailed {
        /// A description of the failure
        message: String,
    },
    /// No bootup message arrived in time
    #[snafu(display("Timed out after {timeout:?} waiting for bootup"))]
    BootupTimeout {
        /// The timeout which elapsed
        timeout: Duration,
    },
    /// The node is not associated with a network
    Detached,
}

/// Events emitted by an [`NmtTracker`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmtEvent {
    /// The node sent a bootup message. Emitted before the state events for the same heartbeat.
    Bootup,
    /// A heartbeat reported this state
    Entered(NmtState),
    /// The tracked state was updated by a heartbeat
    StateChanged(NmtState),
}

#[derive(Debug)]
struct NmtStatus {
    state: NmtState,
    timestamp: Option<u64>,
    last_raw: Option<u8>,
}

#[derive(Debug)]
struct NmtInner {
    node_id: NodeId,
    status: Mutex<NmtStatus>,
    events: broadcast::Sender<NmtEvent>,
    link: NetworkLink,
    subscription: Mutex<Option<SubscriptionId>>,
    config: NmtConfig,
}

/// Tracks the NMT state of one node from its heartbeats, and sends it NMT commands
#[derive(Clone, Debug)]
pub struct NmtTracker {
    inner: Arc<NmtInner>,
}

impl NmtTracker {
    pub(crate) fn new(node_id: NodeId, link: NetworkLink, config: NmtConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(NmtInner {
                node_id,
                status: Mutex::new(NmtStatus {
                    state: NmtState::Initialising,
                    timestamp: None,
                    last_raw: None,
                }),
                events,
                link,
                subscription: Mutex::new(None),
                config,
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, NmtStatus> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The tracked state
    pub fn state(&self) -> NmtState {
        self.status().state
    }

    /// Time of the last heartbeat, in network milliseconds
    pub fn timestamp(&self) -> Option<u64> {
        self.status().timestamp
    }

    /// The raw state byte of the last heartbeat
    pub fn last_heartbeat(&self) -> Option<u8> {
        self.status().last_raw
    }

    /// Get a receiver for state events
    pub fn subscribe(&self) -> broadcast::Receiver<NmtEvent> {
        self.inner.events.subscribe()
    }

    /// Process a heartbeat frame from the node
    pub fn on_heartbeat(&self, msg: &CanMessage) {
        let node_id = self.inner.node_id;
        let Some(&raw) = msg.data().first() else {
            log::warn!("Node {node_id}: ignoring empty heartbeat");
            return;
        };

        let state = match NmtState::from_heartbeat(raw) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Node {node_id}: heartbeat with {e}");
                let state = {
                    let mut status = self.status();
                    status.timestamp = Some(msg.timestamp());
                    status.state
                };
                // The heartbeat is still reported, with the state left as it was
                let _ = self.inner.events.send(NmtEvent::StateChanged(state));
                return;
            }
        };

        {
            let mut status = self.status();
            status.state = state;
            status.timestamp = Some(msg.timestamp());
            status.last_raw = Some(raw);
        }

        // Sends only fail when there are no receivers. A bootup is exactly 0x00, with no toggle bit.
        if raw == 0 {
            log::info!("Node {node_id}: bootup");
            let _ = self.inner.events.send(NmtEvent::Bootup);
        }
        let _ = self.inner.events.send(NmtEvent::Entered(state));
        let _ = self.inner.events.send(NmtEvent::StateChanged(state));
    }

    pub(crate) fn listen(&self, bus: &MessageBus) {
        let weak: Weak<NmtInner> = Arc::downgrade(&self.inner);
        let id = bus.subscribe(
            Topic::Id(self.inner.node_id.heartbeat_id().raw()),
            Arc::new(move |msg: &CanMessage| {
                if let Some(inner) = weak.upgrade() {
                    NmtTracker { inner }.on_heartbeat(msg);
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

    /// Send an NMT command to the node
    ///
    /// Commands other than resets update the tracked state immediately, without waiting for a
    /// heartbeat to confirm it.
    pub async fn send_command(&self, command: NmtCommand) -> Result<(), NmtError> {
        let network = self.inner.link.get().context(DetachedSnafu)?;
        if let Some(state) = command.target_state() {
            self.status().state = state;
        }
        network
            .send_message(NMT_CMD_ID, &command.to_bytes(self.inner.node_id.raw()))
            .await
            .map_err(|e| {
                SendFailedSnafu {
                    message: e.to_string(),
                }
                .build()
            })
    }

    /// Request the node move to a state
    pub async fn set_state(&self, target: impl Into<NmtCommand>) -> Result<(), NmtError> {
        self.send_command(target.into()).await
    }

    /// Request a state by name, e.g. "OPERATIONAL" or "RESET COMMUNICATION"
    ///
    /// Nothing is sent if the name is not recognized.
    pub async fn set_state_by_name(&self, name: &str) -> Result<(), NmtError> {
        let command: NmtCommand = name.parse().context(InvalidStateSnafu)?;
        self.send_command(command).await
    }

    /// Wait for the node to send a bootup message
    pub async fn wait_for_bootup(&self, timeout: Duration) -> Result<(), NmtError> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(NmtEvent::Bootup) => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return DetachedSnafu.fail(),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BootupTimeoutSnafu { timeout }.build())?
    }

    /// Wait for bootup using the configured default timeout
    pub async fn wait_for_bootup_default(&self) -> Result<(), NmtError> {
        self.wait_for_bootup(self.inner.config.bootup_timeout())
            .await
    }
}
