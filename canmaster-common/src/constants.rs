//! Constants defining standard object and special values
//!
//!

/// Object indices for standard objects
pub mod object_ids {
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// Save objects command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters command object index
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;

    /// The first RPDO communication parameter index. RPDO comm can be stored from 0x1400 to 0x15FF.
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    ///  The first RPDO mapping parameter index. RPDO mappings can be stored from 0x1600 to 0x17FF;
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// The first TPDO communication parameter index. TPDO comms can be stored from 0x1800 to 0x19FF.
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    ///  The first TPDO mapping parameter index. TPDO mappings can be stored from 0x1A00 to 0x1BFF;
    pub const TPDO_MAP_BASE: u16 = 0x1A00;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value ("save" in little endian) which triggers object storage when written to 0x1010
    pub const SAVE_CMD: u32 = 0x65766173;

    /// Magic value ("load" in little endian) which restores defaults when written to 0x1011
    pub const LOAD_CMD: u32 = 0x64616F6C;
}

/// Number of PDOs per bank which the master scans for
pub const MAX_PDOS_PER_BANK: u16 = 32;
