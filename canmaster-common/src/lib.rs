//! Common definitions shared by the canmaster crates.
//!
//! This crate holds everything which is fixed by the CANopen wire protocol: frame and ID types,
//! the SDO command layout, NMT states and commands, PDO mapping descriptors, EMCY messages, and
//! the data type codec used by object dictionaries. Most users will use it through the
//! re-export in `canmaster-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;
pub mod emcy;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod objects;
pub mod pdo;
pub mod sdo;
pub mod traits;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::{open_socketcan, ReceiveError, SocketCanReceiver, SocketCanSender};

pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
pub use objects::{AccessType, CodecError, DataType, Value};
