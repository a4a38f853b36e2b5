use assertables::assert_ok_eq_x;
use canmaster_common::{
    objects::{CodecError, DataType, Value},
    sdo::UploadResponse,
};

/// Every supported type should survive an encode/decode trip at the edges of its range
#[test]
fn test_codec_round_trip() {
    let cases = [
        (DataType::Boolean, Value::Bool(true)),
        (DataType::Boolean, Value::Bool(false)),
        (DataType::Int8, Value::I8(i8::MIN)),
        (DataType::Int16, Value::I16(-2)),
        (DataType::Int32, Value::I32(i32::MAX)),
        (DataType::Int64, Value::I64(i64::MIN)),
        (DataType::UInt8, Value::U8(u8::MAX)),
        (DataType::UInt16, Value::U16(0x1234)),
        (DataType::UInt32, Value::U32(0xDEAD_BEEF)),
        (DataType::UInt64, Value::U64(u64::MAX)),
        (DataType::Real32, Value::F32(1.5)),
        (DataType::Real64, Value::F64(-0.25)),
        (DataType::VisibleString, Value::String("motor".into())),
        (DataType::UnicodeString, Value::String("µs".into())),
        (DataType::OctetString, Value::Bytes(vec![1, 2, 3])),
        (DataType::Domain, Value::Bytes(vec![])),
    ];

    for (data_type, value) in cases {
        let raw = data_type.encode(&value).unwrap();
        if let Some(size) = data_type.size() {
            assert_eq!(size, raw.len(), "{data_type:?}");
        }
        assert_eq!(Ok(value), data_type.decode(&raw), "{data_type:?}");
    }
}

#[test]
fn test_little_endian_layout() {
    assert_ok_eq_x!(DataType::UInt16.encode(&Value::U16(0x1234)), vec![0x34, 0x12]);
    assert_ok_eq_x!(
        DataType::UnicodeString.encode(&Value::String("AB".into())),
        vec![0x41, 0, 0x42, 0]
    );
    assert_ok_eq_x!(DataType::Boolean.decode(&[7]), Value::Bool(true));
}

#[test]
fn test_expedited_response_decodes_to_u16() {
    let frame = [0x4B, 0x00, 0x60, 0x01, 0x34, 0x12, 0, 0];
    let Some(UploadResponse::Expedited(data)) = UploadResponse::parse(&frame) else {
        panic!("expected expedited response");
    };
    assert_ok_eq_x!(DataType::UInt16.decode(&data), Value::U16(0x1234));
}

#[test]
fn test_unknown_type_code() {
    assert_eq!(
        Err(CodecError::UnknownType { code: 0x0C }),
        DataType::from_code(0x0C)
    );
}

/// Integers are range checked against the target width, whatever the width of the value given
#[test]
fn test_integer_bounds() {
    let cases: [(DataType, i128, i128); 8] = [
        (DataType::Int8, i8::MIN.into(), i8::MAX.into()),
        (DataType::Int16, i16::MIN.into(), i16::MAX.into()),
        (DataType::Int32, i32::MIN.into(), i32::MAX.into()),
        (DataType::Int64, i64::MIN.into(), i64::MAX.into()),
        (DataType::UInt8, 0, u8::MAX.into()),
        (DataType::UInt16, 0, u16::MAX.into()),
        (DataType::UInt32, 0, u32::MAX.into()),
        (DataType::UInt64, 0, u64::MAX.into()),
    ];

    let value = |v: i128| {
        if v < 0 {
            Value::I64(v as i64)
        } else {
            Value::U64(v as u64)
        }
    };

    for (data_type, min, max) in cases {
        for edge in [min, max] {
            let raw = data_type.encode(&value(edge)).unwrap();
            assert_eq!(data_type.size(), Some(raw.len()), "{data_type:?}");
            let decoded = data_type.decode(&raw).unwrap();
            assert_eq!(Some(edge), decoded.as_i128(), "{data_type:?}");
        }

        // One past each end, where that is representable as a value at all
        let beyond = [min - 1, max + 1]
            .into_iter()
            .filter(|v| i64::try_from(*v).is_ok() || u64::try_from(*v).is_ok());
        for outside in beyond {
            assert!(
                matches!(
                    data_type.encode(&value(outside)),
                    Err(CodecError::OutOfRange { .. })
                ),
                "{data_type:?} accepted {outside}"
            );
        }
    }

    assert_eq!(
        Err(CodecError::OutOfRange {
            data_type: DataType::UInt8,
            value: Value::I8(-1),
        }),
        DataType::UInt8.encode(&Value::I8(-1))
    );
}
