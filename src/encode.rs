//! Encode [`Value`]s as MessagePack frames.
//!
//! The subscriber side never produces frames on its own; this module exists
//! for producers, demos and tests that need to feed the pipeline.
use crate::Value;

/// Serialize a [`Value`] as one MessagePack frame.
///
/// Integers and strings use the smallest encoding that fits, which is what
/// `decode` happily reads back.
pub fn value(value: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_value(&mut bytes, value);
    bytes
}

fn write_value(bytes: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Nil => bytes.push(0xc0),
        Value::Bool(false) => bytes.push(0xc2),
        Value::Bool(true) => bytes.push(0xc3),
        Value::Int(value) => write_int(bytes, *value),
        // The decoder only yields `UInt` above `i64::MAX`; anything smaller
        // is normalised to the signed encoding so that re-encoding a
        // decoded value is byte-stable.
        Value::UInt(value) => match i64::try_from(*value) {
            Ok(value) => write_int(bytes, value),
            Err(_) => {
                bytes.push(0xcf);
                bytes.extend_from_slice(&value.to_be_bytes());
            }
        },
        Value::F64(value) => {
            bytes.push(0xcb);
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        Value::Str(value) => write_str(bytes, value),
        Value::Bin(value) => write_bin(bytes, value),
        Value::Array(items) => {
            write_array_header(bytes, items.len());
            for item in items {
                write_value(bytes, item);
            }
        }
        Value::Map(entries) => {
            write_map_header(bytes, entries.len());
            for (key, value) in entries {
                write_value(bytes, key);
                write_value(bytes, value);
            }
        }
    }
}

fn write_int(bytes: &mut Vec<u8>, value: i64) {
    match value {
        0..=0x7f => bytes.push(value as u8),
        -32..=-1 => bytes.push(value as u8),
        _ => {
            bytes.push(0xd3);
            bytes.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn write_str(bytes: &mut Vec<u8>, value: &str) {
    let length = value.len();
    if length < 32 {
        bytes.push(0xa0 | length as u8);
    } else if length <= u8::MAX as usize {
        bytes.push(0xd9);
        bytes.push(length as u8);
    } else if length <= u16::MAX as usize {
        bytes.push(0xda);
        bytes.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        bytes.push(0xdb);
        bytes.extend_from_slice(&(length as u32).to_be_bytes());
    }
    bytes.extend_from_slice(value.as_bytes());
}

fn write_bin(bytes: &mut Vec<u8>, value: &[u8]) {
    let length = value.len();
    if length <= u8::MAX as usize {
        bytes.push(0xc4);
        bytes.push(length as u8);
    } else if length <= u16::MAX as usize {
        bytes.push(0xc5);
        bytes.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        bytes.push(0xc6);
        bytes.extend_from_slice(&(length as u32).to_be_bytes());
    }
    bytes.extend_from_slice(value);
}

fn write_array_header(bytes: &mut Vec<u8>, count: usize) {
    if count < 16 {
        bytes.push(0x90 | count as u8);
    } else if count <= u16::MAX as usize {
        bytes.push(0xdc);
        bytes.extend_from_slice(&(count as u16).to_be_bytes());
    } else {
        bytes.push(0xdd);
        bytes.extend_from_slice(&(count as u32).to_be_bytes());
    }
}

fn write_map_header(bytes: &mut Vec<u8>, count: usize) {
    if count < 16 {
        bytes.push(0x80 | count as u8);
    } else if count <= u16::MAX as usize {
        bytes.push(0xde);
        bytes.extend_from_slice(&(count as u16).to_be_bytes());
    } else {
        bytes.push(0xdf);
        bytes.extend_from_slice(&(count as u32).to_be_bytes());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_smallest_int_encodings() {
        assert_eq!(value(&Value::Int(0)), vec![0x00]);
        assert_eq!(value(&Value::Int(127)), vec![0x7f]);
        assert_eq!(value(&Value::Int(-1)), vec![0xff]);
        assert_eq!(value(&Value::Int(-32)), vec![0xe0]);
        assert_eq!(value(&Value::Int(128))[0], 0xd3);
    }

    #[test]
    fn test_small_uint_uses_the_signed_encoding() {
        assert_eq!(value(&Value::UInt(7)), value(&Value::Int(7)));
        assert_eq!(value(&Value::UInt(u64::MAX))[0], 0xcf);
    }

    #[test]
    fn test_str_header_scales_with_length() {
        assert_eq!(value(&Value::from("hi")), vec![0xa2, b'h', b'i']);

        let long = "x".repeat(40);
        let frame = value(&Value::from(long.as_str()));
        assert_eq!(frame[0], 0xd9);
        assert_eq!(frame[1], 40);
    }

    #[test]
    fn test_decode_reads_back_encoded_values() {
        let samples = vec![
            Value::Nil,
            Value::Bool(true),
            Value::Int(-1234),
            Value::UInt(u64::MAX),
            Value::F64(3.25),
            Value::from("position"),
            Value::Bin(vec![0, 1, 2]),
            Value::Array(vec![Value::Int(1), Value::from("two")]),
            Value::Map(vec![
                (Value::from("msg_uuid"), Value::from("1")),
                (Value::from("lat"), Value::F64(48.1)),
                (
                    Value::from("track"),
                    Value::Array(vec![Value::Int(1), Value::Int(2)]),
                ),
            ]),
        ];

        for sample in samples {
            assert_eq!(decode::value(&value(&sample)).unwrap(), sample);
        }
    }
}
