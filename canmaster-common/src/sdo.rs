//! SDO protocol definitions
//!
//! Only the expedited and segmented transfer frames which a master needs are modelled here: the
//! request frames it sends, and the headers and segments it receives back.

use int_enum::IntEnum;

/// Client command specifier: initiate download
pub const REQUEST_DOWNLOAD: u8 = 1 << 5;
/// Client command specifier: initiate upload
pub const REQUEST_UPLOAD: u8 = 2 << 5;
/// Client command specifier: upload segment
pub const REQUEST_SEGMENT_UPLOAD: u8 = 3 << 5;
/// Server command specifier: upload segment
pub const RESPONSE_SEGMENT_UPLOAD: u8 = 0;
/// Server command specifier: initiate upload
pub const RESPONSE_UPLOAD: u8 = 2 << 5;
/// Server command specifier: initiate download
pub const RESPONSE_DOWNLOAD: u8 = 3 << 5;
/// Command specifier of an abort transfer frame (either direction)
pub const ABORT: u8 = 4 << 5;

/// Mask which selects the command specifier bits
pub const COMMAND_MASK: u8 = 0xE0;
/// Expedited transfer flag
pub const EXPEDITED: u8 = 0x02;
/// Size indicated flag
pub const SIZE_SPECIFIED: u8 = 0x01;
/// Toggle bit of segment frames
pub const TOGGLE_BIT: u8 = 0x10;
/// Set on the final segment of a transfer
pub const NO_MORE_DATA: u8 = 0x01;

/// Largest payload which fits in an expedited transfer
pub const MAX_EXPEDITED_SIZE: usize = 4;

/// SDO abort codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the object dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnnallowedPdo = 0x0604_0041,
    /// The number and length of the objects to be mapped would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility reason
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to a hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter written too high
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter written too low
    ValueTooLow = 0x0609_0032,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred because of the present device state
    CantStoreDeviceState = 0x0800_0022,
    /// No data available
    NoData = 0x0800_0024,
}

/// Build an initiate upload request
pub fn upload_request(index: u16, sub: u8) -> [u8; 8] {
    let mut buf = [0; 8];
    buf[0] = REQUEST_UPLOAD;
    buf[1..3].copy_from_slice(&index.to_le_bytes());
    buf[3] = sub;
    buf
}

/// Build an upload segment request
pub fn upload_segment_request(toggle: bool) -> [u8; 8] {
    let mut buf = [0; 8];
    buf[0] = REQUEST_SEGMENT_UPLOAD | if toggle { TOGGLE_BIT } else { 0 };
    buf
}

/// Build an expedited download request
///
/// Returns None if the data does not fit in an expedited transfer
pub fn expedited_download_request(index: u16, sub: u8, data: &[u8]) -> Option<[u8; 8]> {
    if data.is_empty() || data.len() > MAX_EXPEDITED_SIZE {
        return None;
    }
    let n = (MAX_EXPEDITED_SIZE - data.len()) as u8;
    let mut buf = [0; 8];
    buf[0] = REQUEST_DOWNLOAD | EXPEDITED | SIZE_SPECIFIED | (n << 2);
    buf[1..3].copy_from_slice(&index.to_le_bytes());
    buf[3] = sub;
    buf[4..4 + data.len()].copy_from_slice(data);
    Some(buf)
}

/// Build an abort transfer frame
pub fn abort_request(index: u16, sub: u8, code: AbortCode) -> [u8; 8] {
    let mut buf = [0; 8];
    buf[0] = ABORT;
    buf[1..3].copy_from_slice(&index.to_le_bytes());
    buf[3] = sub;
    buf[4..8].copy_from_slice(&u32::from(code).to_le_bytes());
    buf
}

/// The command/index/subindex header found at the start of initiate and abort frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdoHeader {
    /// The full command byte
    pub command: u8,
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
}

impl SdoHeader {
    /// Parse a header from frame data
    ///
    /// Returns None if the data is shorter than 4 bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        Some(Self {
            command: data[0],
            index: u16::from_le_bytes([data[1], data[2]]),
            sub: data[3],
        })
    }

    /// The command specifier bits of the command byte
    pub fn specifier(&self) -> u8 {
        self.command & COMMAND_MASK
    }

    /// Return true if this header is for the given object
    pub fn is_for(&self, index: u16, sub: u8) -> bool {
        self.index == index && self.sub == sub
    }

    /// Return true if this is an abort frame
    pub fn is_abort(&self) -> bool {
        self.specifier() == ABORT
    }
}

/// The response to an initiate upload request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadResponse {
    /// The value was returned directly in the response
    Expedited(Vec<u8>),
    /// The value will be transferred in segments
    Segmented {
        /// The total size, when the server indicated one
        size: Option<u32>,
    },
}

impl UploadResponse {
    /// Parse an initiate upload response
    ///
    /// Returns None if the frame is too short for the flags it carries
    pub fn parse(data: &[u8]) -> Option<Self> {
        let command = *data.first()?;
        if command & EXPEDITED != 0 {
            let len = if command & SIZE_SPECIFIED != 0 {
                MAX_EXPEDITED_SIZE - ((command >> 2) & 0x3) as usize
            } else {
                MAX_EXPEDITED_SIZE
            };
            let payload = data.get(4..4 + len)?;
            Some(UploadResponse::Expedited(payload.to_vec()))
        } else if command & SIZE_SPECIFIED != 0 {
            let size = data.get(4..8)?;
            Some(UploadResponse::Segmented {
                size: Some(u32::from_le_bytes([size[0], size[1], size[2], size[3]])),
            })
        } else {
            Some(UploadResponse::Segmented { size: None })
        }
    }
}

/// A segment received during a segmented upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSegment {
    /// The toggle bit
    pub toggle: bool,
    /// Set on the final segment
    pub last: bool,
    /// The segment payload
    pub data: Vec<u8>,
}

impl UploadSegment {
    /// Parse an upload segment response
    ///
    /// Returns None if the frame is shorter than the length it indicates
    pub fn parse(data: &[u8]) -> Option<Self> {
        let command = *data.first()?;
        let len = 7 - ((command >> 1) & 0x7) as usize;
        let payload = data.get(1..1 + len)?;
        Some(Self {
            toggle: command & TOGGLE_BIT != 0,
            last: command & NO_MORE_DATA != 0,
            data: payload.to_vec(),
        })
    }
}

/// Extract the abort code from an abort frame, if the frame is long enough to carry one
pub fn abort_code(data: &[u8]) -> Option<u32> {
    let code = data.get(4..8)?;
    Some(u32::from_le_bytes([code[0], code[1], code[2], code[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_request_layout() {
        assert_eq!([0x40, 0x00, 0x60, 0x01, 0, 0, 0, 0], upload_request(0x6000, 1));
        assert_eq!([0x70, 0, 0, 0, 0, 0, 0, 0], upload_segment_request(true));
    }

    #[test]
    fn test_expedited_download_layout() {
        let req = expedited_download_request(0x2000, 2, &[0x34, 0x12]).unwrap();
        assert_eq!([0x2B, 0x00, 0x20, 0x02, 0x34, 0x12, 0, 0], req);
        let req = expedited_download_request(0x2000, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(0x23, req[0]);
        assert!(expedited_download_request(0x2000, 0, &[0; 5]).is_none());
        assert!(expedited_download_request(0x2000, 0, &[]).is_none());
    }

    #[test]
    fn test_parse_expedited_upload() {
        let resp = UploadResponse::parse(&[0x4B, 0x00, 0x60, 0x01, 0x34, 0x12, 0, 0]).unwrap();
        assert_eq!(UploadResponse::Expedited(vec![0x34, 0x12]), resp);

        // No size indicated: all four bytes are returned
        let resp = UploadResponse::parse(&[0x42, 0x00, 0x60, 0x01, 1, 2, 3, 4]).unwrap();
        assert_eq!(UploadResponse::Expedited(vec![1, 2, 3, 4]), resp);
    }

    #[test]
    fn test_parse_segmented_upload() {
        let resp = UploadResponse::parse(&[0x41, 0x08, 0x10, 0x00, 20, 0, 0, 0]).unwrap();
        assert_eq!(UploadResponse::Segmented { size: Some(20) }, resp);

        let seg = UploadSegment::parse(&[0x1B, b'a', b'b', 0, 0, 0, 0, 0]).unwrap();
        assert!(seg.toggle);
        assert!(seg.last);
        assert_eq!(b"ab".to_vec(), seg.data);

        assert!(UploadSegment::parse(&[0x00, 1, 2]).is_none());
    }

    #[test]
    fn test_abort_frame() {
        let buf = abort_request(0x1000, 0, AbortCode::ToggleNotAlternated);
        assert_eq!([0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x03, 0x05], buf);
        assert_eq!(Some(0x0503_0000), abort_code(&buf));
        assert!(SdoHeader::parse(&buf).unwrap().is_abort());
    }
}
