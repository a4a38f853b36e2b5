//! A managed device on the network

use std::sync::Arc;

use canmaster_common::{
    constants::{object_ids, values},
    sdo::SdoHeader,
    CanMessage, NodeId,
};
use tokio::sync::broadcast;

use crate::{
    config::NetworkConfig,
    emcy::EmcyConsumer,
    network::{NetworkCore, NetworkLink},
    nmt::NmtTracker,
    object_dict::ObjectDictionary,
    pdo::PdoNode,
    sdo_client::{SdoClient, SdoClientError},
};

const MESSAGE_CHANNEL_SIZE: usize = 64;

/// A frame routed to a node, with its SDO header when it carries one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeMessage {
    /// The received frame
    pub frame: CanMessage,
    /// The SDO command, index and sub index, for frames of at least 4 bytes
    pub sdo_header: Option<SdoHeader>,
}

/// One remote device, and the clients used to talk to it
///
/// A node is created by [`crate::Network::add_node`]. When it is removed from the network it
/// stops listening and its clients fail with a detached error, but it may be added to a network
/// again.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    od: Arc<ObjectDictionary>,
    sdo: Arc<SdoClient>,
    pdo: PdoNode,
    nmt: NmtTracker,
    emcy: EmcyConsumer,
    link: NetworkLink,
    messages: broadcast::Sender<NodeMessage>,
}

impl Node {
    /// Create a detached node
    ///
    /// Every dictionary entry is bound to the node's SDO client.
    pub fn new(id: NodeId, od: ObjectDictionary, config: &NetworkConfig) -> Self {
        let od = Arc::new(od);
        let link = NetworkLink::default();
        let sdo = SdoClient::new(id, od.clone(), link.clone(), config.sdo);
        for entry in od.entries() {
            entry.bind_sdo(&sdo);
        }
        let pdo = PdoNode::new(&od, &sdo, &link);
        let nmt = NmtTracker::new(id, link.clone(), config.nmt);
        let emcy = EmcyConsumer::new(id);
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_SIZE);
        Self {
            id,
            od,
            sdo,
            pdo,
            nmt,
            emcy,
            link,
            messages,
        }
    }

    /// The node ID
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's object dictionary
    pub fn od(&self) -> &Arc<ObjectDictionary> {
        &self.od
    }

    /// The SDO client
    pub fn sdo(&self) -> &Arc<SdoClient> {
        &self.sdo
    }

    /// The PDO maps
    pub fn pdo(&self) -> &PdoNode {
        &self.pdo
    }

    /// The NMT state tracker
    pub fn nmt(&self) -> &NmtTracker {
        &self.nmt
    }

    /// The emergency consumer
    pub fn emcy(&self) -> &EmcyConsumer {
        &self.emcy
    }

    /// Get a receiver for every frame routed to this node
    pub fn subscribe(&self) -> broadcast::Receiver<NodeMessage> {
        self.messages.subscribe()
    }

    pub(crate) fn deliver(&self, msg: NodeMessage) {
        let _ = self.messages.send(msg);
    }

    /// Return true if the node belongs to a live network
    pub fn is_attached(&self) -> bool {
        self.link.get().is_some()
    }

    pub(crate) fn associate_network(&self, core: &Arc<NetworkCore>) {
        if let Some(old) = self.link.get() {
            if !Arc::ptr_eq(&old, core) {
                self.unlisten(&old);
            }
        }
        self.link.set(core);
        self.nmt.listen(core.bus());
        self.emcy.listen(core.bus());
    }

    /// Detach the node from its network
    ///
    /// Heartbeat, emergency and PDO listeners are removed and periodic PDOs stopped.
    pub fn remove_network(&self) {
        if let Some(core) = self.link.get() {
            self.unlisten(&core);
        }
        self.link.clear();
    }

    fn unlisten(&self, core: &NetworkCore) {
        self.nmt.unlisten(core.bus());
        self.emcy.unlisten(core.bus());
        self.pdo.detach(core.bus());
    }

    /// Ask the device to store its parameters in non-volatile memory
    ///
    /// Sub index 1 stores all parameters.
    pub async fn store(&self, sub: u8) -> Result<(), SdoClientError> {
        self.sdo
            .write_u32(object_ids::SAVE_OBJECTS, sub, values::SAVE_CMD)
            .await
    }

    /// Ask the device to restore its default parameters
    ///
    /// Sub index 1 restores all parameters. The defaults take effect after a reset.
    pub async fn restore(&self, sub: u8) -> Result<(), SdoClientError> {
        self.sdo
            .write_u32(object_ids::RESTORE_DEFAULTS, sub, values::LOAD_CMD)
            .await
    }
}
