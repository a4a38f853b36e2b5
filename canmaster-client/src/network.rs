//! The network router
//!
//! A [`Network`] owns the transport sender, the table of nodes, and the [`MessageBus`] that
//! received frames are published on. Frames are fed in by [`Network::run`], or directly with
//! [`Network::handle_message`].

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock, Weak},
};

use canmaster_common::{
    messages::{CanId, NMT_CMD_ID, NODE_ID_MASK},
    nmt::NmtCommand,
    sdo::SdoHeader,
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError as _},
    CanMessage, NodeId,
};
use futures::future::BoxFuture;
use snafu::Snafu;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{BusReceiver, Handler, MessageBus, SubscriptionId, Topic},
    config::{NetworkConfig, Protocol},
    node::{Node, NodeMessage},
    object_dict::{DictionaryLoader, ObjectDictionary},
};

/// Errors returned by [`Network`] operations
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NetworkError {
    /// Node IDs must be in 1..=127
    #[snafu(display("Invalid node ID {id}"))]
    InvalidNodeId {
        /// The rejected ID
        id: u8,
    },
    /// The transport failed to send a frame
    #[snafu(display("Failed to send CAN message: {message}"))]
    SendFailed {
        /// A description of the failure
        message: String,
    },
    /// The transport failed to receive
    #[snafu(display("Failed to receive CAN message: {message}"))]
    ReceiveFailed {
        /// A description of the failure
        message: String,
    },
    /// A dictionary loader failed
    #[snafu(display("Failed to load object dictionary: {message}"))]
    LoadFailed {
        /// The loader's error message
        message: String,
    },
}

/// Object safe form of [`AsyncCanSender`]
trait DynSender: Send {
    fn send_boxed(&mut self, msg: CanMessage) -> BoxFuture<'_, Result<(), String>>;
}

impl<S: AsyncCanSender> DynSender for S {
    fn send_boxed(&mut self, msg: CanMessage) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move { self.send(msg).await.map_err(|e| e.message()) })
    }
}

/// The shared state behind a [`Network`]
pub(crate) struct NetworkCore {
    bus: Arc<MessageBus>,
    nodes: RwLock<BTreeMap<u8, Arc<Node>>>,
    sender: tokio::sync::Mutex<Box<dyn DynSender>>,
    epoch: Instant,
    config: NetworkConfig,
    cancel: Mutex<CancellationToken>,
}

impl NetworkCore {
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn node(&self, id: u8) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub async fn send_message(&self, id: CanId, data: &[u8]) -> Result<(), NetworkError> {
        let msg = CanMessage::new(id, data);
        let mut sender = self.sender.lock().await;
        sender
            .send_boxed(msg)
            .await
            .map_err(|message| SendFailedSnafu { message }.build())
    }

    fn handle_message(&self, msg: CanMessage) {
        let msg = if msg.timestamp() == 0 {
            msg.with_timestamp(self.now_ms())
        } else {
            msg
        };

        match self.config.protocol {
            Protocol::Raw => self.bus.publish_topic(Topic::Any, &msg),
            Protocol::CanOpen => {
                let node_id = (msg.arbitration_id() & NODE_ID_MASK) as u8;
                if let Some(node) = self.node(node_id) {
                    let sdo_header = if msg.data().len() >= 4 {
                        SdoHeader::parse(msg.data())
                    } else {
                        None
                    };
                    node.deliver(NodeMessage {
                        frame: msg,
                        sdo_header,
                    });
                }
                self.bus.publish(&msg);
            }
        }
    }
}

/// A weak, replaceable reference from a node's components to the network it belongs to
#[derive(Clone, Debug, Default)]
pub(crate) struct NetworkLink(Arc<RwLock<Option<Weak<NetworkCore>>>>);

impl NetworkLink {
    pub fn get(&self) -> Option<Arc<NetworkCore>> {
        self.0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn set(&self, core: &Arc<NetworkCore>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(core));
    }

    pub fn clear(&self) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// A CANopen network with a set of managed nodes
///
/// Clones refer to the same network.
#[derive(Clone)]
pub struct Network {
    core: Arc<NetworkCore>,
}

impl core::fmt::Debug for NetworkCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkCore")
            .field("config", &self.config)
            .field("bus", &self.bus)
            .finish()
    }
}

impl core::fmt::Debug for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Network")
            .field("nodes", &self.node_ids())
            .field("protocol", &self.core.config.protocol)
            .finish()
    }
}

impl Network {
    /// Create a network with the default configuration
    pub fn new<S: AsyncCanSender + 'static>(sender: S) -> Self {
        Self::with_config(sender, NetworkConfig::default())
    }

    /// Create a network
    ///
    /// The SDO timing in `config` is applied to every node added to the network.
    pub fn with_config<S: AsyncCanSender + 'static>(sender: S, config: NetworkConfig) -> Self {
        Self {
            core: Arc::new(NetworkCore {
                bus: Arc::new(MessageBus::new()),
                nodes: RwLock::new(BTreeMap::new()),
                sender: tokio::sync::Mutex::new(Box::new(sender)),
                epoch: Instant::now(),
                config,
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// The network configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.core.config
    }

    /// The bus received frames are published on
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.core.bus
    }

    /// Milliseconds since the network was created, the time base of frame timestamps
    pub fn now_ms(&self) -> u64 {
        self.core.now_ms()
    }

    /// Create a node with the given dictionary and add it to the network
    ///
    /// A node already registered with the same ID is detached and replaced.
    pub fn add_node(&self, id: u8, od: ObjectDictionary) -> Result<Arc<Node>, NetworkError> {
        let node_id = NodeId::new(id).map_err(|_| InvalidNodeIdSnafu { id }.build())?;
        let node = Arc::new(Node::new(node_id, od, &self.core.config));
        self.insert_node(node.clone());
        Ok(node)
    }

    /// Load a dictionary and add a node using it
    pub fn add_node_with<L: DictionaryLoader>(
        &self,
        id: u8,
        loader: &L,
        source: &str,
    ) -> Result<Arc<Node>, NetworkError> {
        let od = loader.load(source).map_err(|e| {
            LoadFailedSnafu {
                message: e.to_string(),
            }
            .build()
        })?;
        self.add_node(id, od)
    }

    /// Add an existing node, e.g. one previously removed from this or another network
    pub fn insert_node(&self, node: Arc<Node>) {
        let id = node.id().raw();
        node.associate_network(&self.core);
        let old = self
            .core
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, node.clone());
        if let Some(old) = old.filter(|old| !Arc::ptr_eq(old, &node)) {
            old.remove_network();
        }
        log::info!("Added node {id}");
    }

    /// Remove a node from the network, detaching it
    pub fn remove_node(&self, id: u8) -> Option<Arc<Node>> {
        let node = self
            .core
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)?;
        node.remove_network();
        log::info!("Removed node {id}");
        Some(node)
    }

    /// Get a node by ID
    pub fn node(&self, id: u8) -> Option<Arc<Node>> {
        self.core.node(id)
    }

    /// The IDs of all registered nodes
    pub fn node_ids(&self) -> Vec<u8> {
        self.core
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Dispatch a received frame
    ///
    /// Frames without a timestamp are stamped with the current network time.
    pub fn handle_message(&self, msg: CanMessage) {
        self.core.handle_message(msg);
    }

    /// Send a data frame
    pub async fn send_message(&self, id: CanId, data: &[u8]) -> Result<(), NetworkError> {
        self.core.send_message(id, data).await
    }

    /// Register a callback for received frames
    pub fn subscribe(&self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.core.bus.subscribe(topic, handler)
    }

    /// Register a queue for received frames
    pub fn subscribe_channel(&self, topic: Topic) -> BusReceiver {
        self.core.bus.subscribe_channel(topic)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.bus.unsubscribe(id)
    }

    /// Send an NMT command to all nodes
    pub async fn broadcast_nmt(&self, command: NmtCommand) -> Result<(), NetworkError> {
        self.send_message(NMT_CMD_ID, &command.to_bytes(0)).await
    }

    /// Receive and dispatch frames until [`Network::stop`] is called
    ///
    /// Returns an error if the receiver fails.
    pub async fn run<R: AsyncCanReceiver>(&self, mut receiver: R) -> Result<(), NetworkError> {
        let token = self
            .core
            .cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        log::info!("Network receive loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Network receive loop stopped");
                    return Ok(());
                }
                result = receiver.recv() => match result {
                    Ok(msg) => self.handle_message(msg),
                    Err(e) => {
                        log::error!("Error reading from CAN receiver: {e:?}");
                        return ReceiveFailedSnafu {
                            message: format!("{e:?}"),
                        }
                        .fail();
                    }
                }
            }
        }
    }

    /// Spawn [`Network::run`] on the current tokio runtime
    pub fn spawn<R: AsyncCanReceiver + 'static>(
        &self,
        receiver: R,
    ) -> tokio::task::JoinHandle<Result<(), NetworkError>> {
        let network = self.clone();
        tokio::spawn(async move { network.run(receiver).await })
    }

    /// Stop any running receive loop
    ///
    /// The network may be run again afterwards.
    pub fn stop(&self) {
        let mut cancel = self.core.cancel.lock().unwrap_or_else(|e| e.into_inner());
        cancel.cancel();
        *cancel = CancellationToken::new();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingSender(Arc<Mutex<Vec<CanMessage>>>);

    impl AsyncCanSender for RecordingSender {
        type Error = CanMessage;

        async fn send(&mut self, msg: CanMessage) -> Result<(), CanMessage> {
            self.0.lock().unwrap().push(msg);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_add_node_validates_id() {
        let network = Network::new(RecordingSender::default());
        assert_eq!(
            Err(NetworkError::InvalidNodeId { id: 0 }),
            network.add_node(0, ObjectDictionary::new()).map(|_| ())
        );
        assert_eq!(
            Err(NetworkError::InvalidNodeId { id: 128 }),
            network.add_node(128, ObjectDictionary::new()).map(|_| ())
        );
        network.add_node(5, ObjectDictionary::new()).unwrap();
        assert_eq!(vec![5], network.node_ids());
    }

    #[tokio::test]
    async fn test_node_messages_carry_sdo_header() {
        let network = Network::new(RecordingSender::default());
        let node = network.add_node(3, ObjectDictionary::new()).unwrap();
        let mut rx = node.subscribe();

        network.handle_message(CanMessage::new(
            CanId::std(0x583),
            &[0x4B, 0x00, 0x60, 0x01, 0x34, 0x12, 0, 0],
        ));
        network.handle_message(CanMessage::new(CanId::std(0x703), &[0x05]));

        let first = rx.try_recv().unwrap();
        assert_eq!(
            Some(SdoHeader {
                command: 0x4B,
                index: 0x6000,
                sub: 1
            }),
            first.sdo_header
        );
        let second = rx.try_recv().unwrap();
        assert_eq!(None, second.sdo_header);
    }

    #[tokio::test]
    async fn test_raw_protocol_skips_routing() {
        let config = NetworkConfig {
            protocol: Protocol::Raw,
            ..Default::default()
        };
        let network = Network::with_config(RecordingSender::default(), config);
        let node = network.add_node(3, ObjectDictionary::new()).unwrap();
        let mut node_rx = node.subscribe();

        let by_id = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        let c = by_id.clone();
        network.subscribe(
            Topic::Id(0x703),
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let c = any.clone();
        network.subscribe(
            Topic::Any,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );

        network.handle_message(CanMessage::new(CanId::std(0x703), &[0x05]));
        assert_eq!(0, by_id.load(Ordering::Relaxed));
        assert_eq!(1, any.load(Ordering::Relaxed));
        assert!(node_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_nmt() {
        let sender = RecordingSender::default();
        let network = Network::new(sender.clone());
        network.broadcast_nmt(NmtCommand::Start).await.unwrap();
        let sent = sender.0.lock().unwrap().clone();
        assert_eq!(vec![CanMessage::new(CanId::std(0), &[1, 0])], sent);
    }
}
