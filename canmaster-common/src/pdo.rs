//! Definitions and data types related to PDOs

/// Bit in the PDO COB-ID word which marks the PDO as not valid (disabled)
pub const PDO_NOT_VALID: u32 = 1 << 31;
/// Bit in the PDO COB-ID word which marks RTR as not allowed
pub const RTR_NOT_ALLOWED: u32 = 1 << 30;
/// Bit in the PDO COB-ID word which selects a 29-bit identifier
pub const EXTENDED_FRAME: u32 = 1 << 29;
/// Mask of the identifier bits in the PDO COB-ID word
pub const COB_ID_MASK: u32 = 0x1FFF_FFFF;

/// Highest transmission type which does not use the event timer
pub const MAX_SYNC_TRANSMISSION_TYPE: u8 = 254;

/// Represents a PDO mapping
///
/// Each mapping specifies one sub-object to be included in the PDO data bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the object to map, in **bits**
    pub size: u8,
}

impl PdoMapping {
    /// Convert a PdoMapping object to the u32 representation stored in the PdoMapping object
    pub fn to_object_value(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | (self.size as u32)
    }

    /// Create a PdoMapping object from the raw u32 representation stored in the PdoMapping object
    pub fn from_object_value(value: u32) -> Self {
        let index = (value >> 16) as u16;
        let sub = ((value >> 8) & 0xff) as u8;
        let size = (value & 0xff) as u8;
        Self { index, sub, size }
    }
}

/// The decoded sub 1 (COB-ID) word of a PDO communication object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PdoCobId {
    /// The identifier the PDO is exchanged on
    pub cob_id: u32,
    /// False when the not-valid bit is set
    pub enabled: bool,
    /// False when the RTR-not-allowed bit is set
    pub rtr_allowed: bool,
}

impl PdoCobId {
    /// Decode the raw COB-ID word
    pub fn from_object_value(value: u32) -> Self {
        Self {
            cob_id: value & COB_ID_MASK,
            enabled: value & PDO_NOT_VALID == 0,
            rtr_allowed: value & RTR_NOT_ALLOWED == 0,
        }
    }

    /// Encode the COB-ID word, forcing the not-valid bit when `disabled` is true
    pub fn to_object_value(&self, disabled: bool) -> u32 {
        let mut value = self.cob_id & COB_ID_MASK;
        if self.cob_id > 0x7FF {
            value |= EXTENDED_FRAME;
        }
        if disabled || !self.enabled {
            value |= PDO_NOT_VALID;
        }
        if !self.rtr_allowed {
            value |= RTR_NOT_ALLOWED;
        }
        value
    }
}
