//! Types for representing node IDs
//!

use crate::messages::{CanId, EMCY_BASE, HEARTBEAT_BASE, SDO_REQ_BASE, SDO_RESP_BASE};

/// A newtype on u8 to enforce valid node ID (1-127)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    /// Try to create a new NodeId
    ///
    /// It will fail if value is invalid (i.e. <1 or >127)
    pub const fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value > 0 && value < 128 {
            Ok(NodeId(value))
        } else {
            Err(InvalidNodeIdError(value))
        }
    }

    /// Get the raw node ID as a u8
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// The COB-ID the node's default SDO server listens on
    pub const fn sdo_request_id(&self) -> CanId {
        CanId::Std(SDO_REQ_BASE + self.0 as u16)
    }

    /// The COB-ID the node's default SDO server responds on
    pub const fn sdo_response_id(&self) -> CanId {
        CanId::Std(SDO_RESP_BASE + self.0 as u16)
    }

    /// The COB-ID the node sends heartbeats on
    pub const fn heartbeat_id(&self) -> CanId {
        CanId::Std(HEARTBEAT_BASE + self.0 as u16)
    }

    /// The COB-ID the node sends emergency messages on
    pub const fn emcy_id(&self) -> CanId {
        CanId::Std(EMCY_BASE + self.0 as u16)
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error for converting u8 to a NodeId
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNodeIdError(pub u8);

impl core::fmt::Display for InvalidNodeIdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Invalid node ID {}", self.0)
    }
}
impl core::error::Error for InvalidNodeIdError {}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(128).is_err());
        assert!(NodeId::new(255).is_err());
        assert_eq!(127, NodeId::new(127).unwrap().raw());
    }

    #[test]
    fn test_cob_ids() {
        let id = NodeId::new(3).unwrap();
        assert_eq!(CanId::Std(0x603), id.sdo_request_id());
        assert_eq!(CanId::Std(0x583), id.sdo_response_id());
        assert_eq!(CanId::Std(0x703), id.heartbeat_id());
        assert_eq!(CanId::Std(0x83), id.emcy_id());
    }
}
