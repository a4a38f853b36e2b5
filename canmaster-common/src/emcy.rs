//! Emergency (EMCY) message definitions

/// Error code classes, matched in order by `code & mask == class`
const DESCRIPTIONS: &[(u16, u16, &str)] = &[
    (0x0000, 0xFF00, "Error Reset / No Error"),
    (0x1000, 0xFF00, "Generic Error"),
    (0x2000, 0xF000, "Current"),
    (0x3000, 0xF000, "Voltage"),
    (0x4000, 0xF000, "Temperature"),
    (0x5000, 0xFF00, "Device Hardware"),
    (0x6000, 0xF000, "Device Software"),
    (0x7000, 0xFF00, "Additional Modules"),
    (0x8000, 0xF000, "Monitoring"),
    (0x9000, 0xFF00, "External Error"),
    (0xF000, 0xFF00, "Additional Functions"),
    (0xFF00, 0xFF00, "Device Specific"),
];

/// Look up the description of the class an emergency error code belongs to
pub fn describe(code: u16) -> Option<&'static str> {
    DESCRIPTIONS
        .iter()
        .find(|(class, mask, _)| code & mask == *class)
        .map(|(_, _, desc)| *desc)
}

/// A decoded emergency message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmcyError {
    /// The emergency error code
    pub code: u16,
    /// The value of the error register (object 0x1001)
    pub register: u8,
    /// Manufacturer specific error data
    pub data: [u8; 5],
    /// Receive time of the message, in milliseconds
    pub timestamp: u64,
}

impl EmcyError {
    /// Decode the payload of an EMCY frame
    ///
    /// Returns None when the payload is shorter than the code and register fields. Missing
    /// manufacturer bytes are zero filled.
    pub fn from_bytes(data: &[u8], timestamp: u64) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        let mut extra = [0; 5];
        let n = (data.len() - 3).min(5);
        extra[..n].copy_from_slice(&data[3..3 + n]);
        Some(Self {
            code: u16::from_le_bytes([data[0], data[1]]),
            register: data[2],
            data: extra,
            timestamp,
        })
    }

    /// Return true if this message signals that all errors were cleared
    pub fn is_reset(&self) -> bool {
        self.code == 0
    }

    /// A description of the error class
    pub fn description(&self) -> Option<&'static str> {
        describe(self.code)
    }
}

impl core::fmt::Display for EmcyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Code 0x{:04X}, {}",
            self.code,
            self.description().unwrap_or("Unknown")
        )
    }
}
