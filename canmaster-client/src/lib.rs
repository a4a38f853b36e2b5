//! A CANopen master for managing devices on a CAN bus
//!
//! The central object is the [`Network`], which owns a transport sender and a set of [`Node`]s.
//! Each node is described by an [`ObjectDictionary`] and provides:
//!
//! * An [`SdoClient`] for reading and writing objects on the device. Requests to one node are
//!   served in the order they are made, and retried when the device does not answer.
//! * A [`PdoNode`] with the node's receive and transmit PDO maps, which can be read from or
//!   written to the device, and which pack and unpack mapped variables.
//! * An [`NmtTracker`], following the node's heartbeats and sending it NMT commands.
//! * An [`EmcyConsumer`], collecting the emergency messages the node reports.
//!
//! # Getting Started
//!
//! ```ignore
//! use canmaster_client::{Network, NetworkConfig, ObjectDictionary, Variable};
//! use canmaster_client::common::{DataType, nmt::NmtState};
//!
//! let config = NetworkConfig::load_from_file("network.toml")?;
//! let (tx, rx) = config.open_socketcan()?;
//! let network = Network::with_config(tx, config);
//! network.spawn(rx);
//!
//! let od = ObjectDictionary::new()
//!     .with_object(Variable::new(0x6000, 0, "speed", DataType::Int16));
//! let node = network.add_node(5, od)?;
//! node.nmt().set_state(NmtState::Operational).await?;
//! let speed = node.sdo().read(0x6000, 0).await?;
//! ```
//!
//! Received frames are also published on the network's [`MessageBus`], by arbitration ID and on
//! the wildcard [`Topic::Any`].
#![warn(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bus;
mod config;
mod emcy;
mod network;
mod nmt;
mod node;
mod object_dict;
mod pdo;
mod request_queue;
mod sdo_client;

pub use bus::{BusClosed, BusReceiver, Handler, MessageBus, SubscriptionId, Topic};
pub use config::{ConfigError, NetworkConfig, NmtConfig, Protocol, SdoConfig, TransportKind};
pub use emcy::{EmcyCallback, EmcyConsumer, EmcyEvent};
pub use network::{Network, NetworkError};
pub use nmt::{NmtError, NmtEvent, NmtTracker};
pub use node::{Node, NodeMessage};
pub use object_dict::{
    DictionaryEntry, DictionaryLoader, ObjectDictionary, OdError, Record, Variable,
};
pub use pdo::{PdoError, PdoEvent, PdoKind, PdoMap, PdoMaps, PdoNode};
pub use sdo_client::{Identity, RawAbortCode, SdoClient, SdoClientError};

pub use canmaster_common as common;
