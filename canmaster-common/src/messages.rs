//! CAN frame types and the fixed CANopen COB-ID assignments

/// The arbitration ID of a CAN frame
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CanId {
    /// An 11-bit standard ID
    Std(u16),
    /// A 29-bit extended ID
    Extended(u32),
}

impl CanId {
    /// Create a standard ID. Bits above the 11-bit range are discarded.
    pub const fn std(id: u16) -> Self {
        Self::Std(id & 0x7FF)
    }

    /// Create an extended ID. Bits above the 29-bit range are discarded.
    pub const fn extended(id: u32) -> Self {
        Self::Extended(id & 0x1FFF_FFFF)
    }

    /// Get the raw arbitration ID
    pub const fn raw(&self) -> u32 {
        match self {
            CanId::Std(id) => *id as u32,
            CanId::Extended(id) => *id,
        }
    }

    /// Return true if this is an extended ID
    pub const fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }

    /// Create an ID from a raw arbitration ID, choosing the extended format only when the value
    /// does not fit into 11 bits
    pub const fn from_raw(id: u32) -> Self {
        if id > 0x7FF {
            Self::extended(id)
        } else {
            Self::Std(id as u16)
        }
    }
}

impl core::fmt::Display for CanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CanId::Std(id) => write!(f, "0x{id:03X}"),
            CanId::Extended(id) => write!(f, "0x{id:08X}x"),
        }
    }
}

impl From<u16> for CanId {
    fn from(value: u16) -> Self {
        CanId::std(value)
    }
}

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// A single CAN frame
///
/// Messages are immutable once received. Outgoing messages are constructed fresh for each send.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The arbitration ID
    pub id: CanId,
    data: [u8; MAX_DATA_LENGTH],
    dlc: u8,
    rtr: bool,
    timestamp: u64,
}

impl CanMessage {
    /// Create a new data frame
    ///
    /// Data beyond 8 bytes is truncated.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len().min(MAX_DATA_LENGTH);
        let mut buf = [0; MAX_DATA_LENGTH];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            data: buf,
            dlc: dlc as u8,
            rtr: false,
            timestamp: 0,
        }
    }

    /// Create a new remote transmission request frame
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            rtr: true,
            timestamp: 0,
        }
    }

    /// Return a copy of this message carrying the given timestamp, in milliseconds
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get the arbitration ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the raw arbitration ID
    pub fn arbitration_id(&self) -> u32 {
        self.id.raw()
    }

    /// Get the data bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Get the data length code
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Return true if this is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    /// The time the message was received, in milliseconds since the network was created
    ///
    /// Zero for messages which have not been received through a network.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// The ID used for NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The ID used for SYNC messages
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// Base of the EMCY COB-IDs; a node sends emergencies on `EMCY_BASE + node_id`
pub const EMCY_BASE: u16 = 0x80;
/// Base of the SDO response COB-IDs (server to client)
pub const SDO_RESP_BASE: u16 = 0x580;
/// Base of the SDO request COB-IDs (client to server)
pub const SDO_REQ_BASE: u16 = 0x600;
/// Base of the heartbeat COB-IDs
pub const HEARTBEAT_BASE: u16 = 0x700;

/// Mask which extracts the node ID from a function-code based COB-ID
pub const NODE_ID_MASK: u32 = 0x7F;
