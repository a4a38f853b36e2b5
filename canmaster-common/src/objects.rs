//! CANopen data types and the codec between raw object bytes and native values
//!
//! All numeric types are stored little endian. Strings are stored without a terminator:
//! VISIBLE_STRING as ASCII, UNICODE_STRING as UTF-16LE. OCTET_STRING and DOMAIN are opaque.

use int_enum::IntEnum;
use snafu::Snafu;

/// The CANopen data type codes supported by the object dictionary
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntEnum)]
#[repr(u8)]
pub enum DataType {
    /// BOOLEAN, one byte, nonzero is true
    Boolean = 0x1,
    /// INTEGER8
    Int8 = 0x2,
    /// INTEGER16
    Int16 = 0x3,
    /// INTEGER32
    Int32 = 0x4,
    /// UNSIGNED8
    UInt8 = 0x5,
    /// UNSIGNED16
    UInt16 = 0x6,
    /// UNSIGNED32
    UInt32 = 0x7,
    /// REAL32
    Real32 = 0x8,
    /// VISIBLE_STRING
    VisibleString = 0x9,
    /// OCTET_STRING
    OctetString = 0xA,
    /// UNICODE_STRING
    UnicodeString = 0xB,
    /// DOMAIN
    Domain = 0xF,
    /// REAL64
    Real64 = 0x11,
    /// INTEGER64
    Int64 = 0x15,
    /// UNSIGNED64
    UInt64 = 0x1B,
}

impl DataType {
    /// Look up a data type from its code
    pub fn from_code(code: u16) -> Result<Self, CodecError> {
        u8::try_from(code)
            .ok()
            .and_then(|c| DataType::try_from(c).ok())
            .ok_or(CodecError::UnknownType { code })
    }

    /// The fixed storage size of the type in bytes, or None for variable length types
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::Boolean | DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Real32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Real64 => Some(8),
            DataType::VisibleString
            | DataType::OctetString
            | DataType::UnicodeString
            | DataType::Domain => None,
        }
    }

    /// The size of the type in bits when mapped into a PDO
    ///
    /// Variable length types have no natural PDO size and are counted as 8 bits. Mapping strings
    /// into PDOs is not supported beyond that.
    pub fn bit_length(&self) -> u32 {
        self.size().map(|s| s as u32 * 8).unwrap_or(8)
    }

    /// True for INTEGER8..INTEGER64
    pub fn is_signed_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    /// True for UNSIGNED8..UNSIGNED64
    pub fn is_unsigned_integer(&self) -> bool {
        matches!(
            self,
            DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64
        )
    }

    /// True for any integer type
    pub fn is_integer(&self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    /// True for REAL32 and REAL64
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Real32 | DataType::Real64)
    }

    /// True for any integer or float type
    pub fn is_number(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// True for the string and opaque byte types
    pub fn is_string_like(&self) -> bool {
        matches!(
            self,
            DataType::VisibleString
                | DataType::OctetString
                | DataType::UnicodeString
                | DataType::Domain
        )
    }

    /// Decode raw object bytes into a value
    pub fn decode(&self, raw: &[u8]) -> Result<Value, CodecError> {
        if let Some(size) = self.size() {
            if raw.len() != size {
                return LengthSnafu {
                    data_type: *self,
                    expected: size,
                    actual: raw.len(),
                }
                .fail();
            }
        }

        macro_rules! le {
            ($t:ty) => {{
                let mut bytes = [0u8; core::mem::size_of::<$t>()];
                bytes.copy_from_slice(raw);
                <$t>::from_le_bytes(bytes)
            }};
        }

        let value = match self {
            DataType::Boolean => Value::Bool(raw[0] != 0),
            DataType::Int8 => Value::I8(le!(i8)),
            DataType::Int16 => Value::I16(le!(i16)),
            DataType::Int32 => Value::I32(le!(i32)),
            DataType::Int64 => Value::I64(le!(i64)),
            DataType::UInt8 => Value::U8(le!(u8)),
            DataType::UInt16 => Value::U16(le!(u16)),
            DataType::UInt32 => Value::U32(le!(u32)),
            DataType::UInt64 => Value::U64(le!(u64)),
            DataType::Real32 => Value::F32(le!(f32)),
            DataType::Real64 => Value::F64(le!(f64)),
            DataType::VisibleString => {
                Value::String(raw.iter().map(|&b| (b & 0x7F) as char).collect())
            }
            DataType::UnicodeString => {
                if raw.len() % 2 != 0 {
                    return InvalidUnicodeSnafu.fail();
                }
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Value::String(String::from_utf16(&units).map_err(|_| InvalidUnicodeSnafu.build())?)
            }
            DataType::OctetString | DataType::Domain => Value::Bytes(raw.to_vec()),
        };
        Ok(value)
    }

    /// Encode a value into raw object bytes
    ///
    /// Integer values are accepted for any integer type as long as they are in range for it.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let mismatch = || CodecError::TypeMismatch {
            data_type: *self,
            value: value.clone(),
        };

        let bytes = match self {
            DataType::Boolean => match value {
                Value::Bool(b) => vec![*b as u8],
                _ => return Err(mismatch()),
            },
            DataType::Real32 => match value {
                Value::F32(f) => f.to_le_bytes().to_vec(),
                _ => return Err(mismatch()),
            },
            DataType::Real64 => match value {
                Value::F64(f) => f.to_le_bytes().to_vec(),
                Value::F32(f) => (*f as f64).to_le_bytes().to_vec(),
                _ => return Err(mismatch()),
            },
            DataType::VisibleString => match value {
                Value::String(s) if s.is_ascii() => s.as_bytes().to_vec(),
                _ => return Err(mismatch()),
            },
            DataType::UnicodeString => match value {
                Value::String(s) => s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect(),
                _ => return Err(mismatch()),
            },
            DataType::OctetString | DataType::Domain => match value {
                Value::Bytes(b) => b.clone(),
                Value::String(s) => s.as_bytes().to_vec(),
                _ => return Err(mismatch()),
            },
            _ => {
                let int = value.as_i128().ok_or_else(mismatch)?;
                macro_rules! int_bytes {
                    ($t:ty) => {
                        <$t>::try_from(int)
                            .map_err(|_| CodecError::OutOfRange {
                                data_type: *self,
                                value: value.clone(),
                            })?
                            .to_le_bytes()
                            .to_vec()
                    };
                }
                match self {
                    DataType::Int8 => int_bytes!(i8),
                    DataType::Int16 => int_bytes!(i16),
                    DataType::Int32 => int_bytes!(i32),
                    DataType::Int64 => int_bytes!(i64),
                    DataType::UInt8 => int_bytes!(u8),
                    DataType::UInt16 => int_bytes!(u16),
                    DataType::UInt32 => int_bytes!(u32),
                    DataType::UInt64 => int_bytes!(u64),
                    _ => return Err(mismatch()),
                }
            }
        };
        Ok(bytes)
    }
}

/// Object access permissions
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read only
    ReadOnly,
    /// Write only
    WriteOnly,
    /// Read and write
    #[default]
    ReadWrite,
    /// Read only, and the value never changes
    Const,
}

impl AccessType {
    /// Return true if the object may be read
    pub fn is_readable(&self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }

    /// Return true if the object may be written
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::WriteOnly | AccessType::ReadWrite)
    }
}

impl core::str::FromStr for AccessType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ro" => Ok(AccessType::ReadOnly),
            "wo" => Ok(AccessType::WriteOnly),
            "rw" | "rww" | "rwr" => Ok(AccessType::ReadWrite),
            "const" => Ok(AccessType::Const),
            _ => UnknownAccessSnafu { access: s }.fail(),
        }
    }
}

/// A decoded object value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// BOOLEAN
    Bool(bool),
    /// INTEGER8
    I8(i8),
    /// INTEGER16
    I16(i16),
    /// INTEGER32
    I32(i32),
    /// INTEGER64
    I64(i64),
    /// UNSIGNED8
    U8(u8),
    /// UNSIGNED16
    U16(u16),
    /// UNSIGNED32
    U32(u32),
    /// UNSIGNED64
    U64(u64),
    /// REAL32
    F32(f32),
    /// REAL64
    F64(f64),
    /// VISIBLE_STRING or UNICODE_STRING
    String(String),
    /// OCTET_STRING or DOMAIN
    Bytes(Vec<u8>),
}

impl Value {
    /// Get any integer value widened to i128
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Value::I8(v) => Some(v as i128),
            Value::I16(v) => Some(v as i128),
            Value::I32(v) => Some(v as i128),
            Value::I64(v) => Some(v as i128),
            Value::U8(v) => Some(v as i128),
            Value::U16(v) => Some(v as i128),
            Value::U32(v) => Some(v as i128),
            Value::U64(v) => Some(v as i128),
            Value::Bool(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Get an unsigned integer value as u64
    ///
    /// Returns None for negative, non-integer, or out of range values
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    /// Get a numeric value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(value: $t) -> Self {
                Value::$variant(value)
            }
        }
    };
}

value_from!(bool, Bool);
value_from!(i8, I8);
value_from!(i16, I16);
value_from!(i32, I32);
value_from!(i64, I64);
value_from!(u8, U8);
value_from!(u16, U16);
value_from!(u32, U32);
value_from!(u64, U64);
value_from!(f32, F32);
value_from!(f64, F64);
value_from!(String, String);
value_from!(Vec<u8>, Bytes);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

/// Errors from encoding or decoding object values
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum CodecError {
    /// The type code does not name a supported data type
    #[snafu(display("Type mismatch: unknown data type code 0x{code:X}"))]
    UnknownType {
        /// The unrecognized code
        code: u16,
    },
    /// The value cannot be stored in the data type
    #[snafu(display("Type mismatch: cannot store {value:?} as {data_type:?}"))]
    TypeMismatch {
        /// The target data type
        data_type: DataType,
        /// The offending value
        value: Value,
    },
    /// The integer value does not fit in the data type
    #[snafu(display("Value {value:?} is out of range for {data_type:?}"))]
    OutOfRange {
        /// The target data type
        data_type: DataType,
        /// The offending value
        value: Value,
    },
    /// The raw data does not have the size of the data type
    #[snafu(display("{data_type:?} requires {expected} bytes, got {actual}"))]
    Length {
        /// The data type being decoded
        data_type: DataType,
        /// The size of the data type
        expected: usize,
        /// The size of the data
        actual: usize,
    },
    /// UNICODE_STRING data is not valid UTF-16
    InvalidUnicode,
    /// An access type string was not recognized
    #[snafu(display("Unknown access type '{access}'"))]
    UnknownAccess {
        /// The unrecognized access string
        access: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        assert_eq!(Ok(DataType::Int64), DataType::from_code(0x15));
        assert_eq!(Ok(DataType::UInt64), DataType::from_code(0x1B));
        assert_eq!(
            Err(CodecError::UnknownType { code: 0x20 }),
            DataType::from_code(0x20)
        );
        assert_eq!(0x11u8, u8::from(DataType::Real64));
    }

    #[test]
    fn test_integer_range_checked() {
        assert_eq!(Ok(vec![0xFF]), DataType::UInt8.encode(&Value::I32(255)));
        assert!(matches!(
            DataType::UInt8.encode(&Value::I32(256)),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            DataType::UInt16.encode(&Value::I8(-1)),
            Err(CodecError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_mismatched_value() {
        assert!(matches!(
            DataType::Boolean.encode(&Value::String("x".into())),
            Err(CodecError::TypeMismatch { .. })
        ));
        assert!(matches!(
            DataType::UInt32.decode(&[1, 2]),
            Err(CodecError::Length { .. })
        ));
    }

    #[test]
    fn test_classification() {
        assert!(DataType::Int64.is_signed_integer());
        assert!(!DataType::UInt8.is_signed_integer());
        assert!(DataType::UInt64.is_unsigned_integer());
        assert!(DataType::Real32.is_float());
        assert!(DataType::Domain.is_string_like());
        assert!(!DataType::Boolean.is_number());
        assert_eq!(8, DataType::VisibleString.bit_length());
        assert_eq!(64, DataType::Real64.bit_length());
    }
}
