// Decode MessagePack frames.
//
use crate::Value;
use std::fmt::Display;

// Frames are produced by external publishers; a hostile or corrupt frame
// must never recurse past this depth.
const MAX_DEPTH: usize = 64;

#[derive(Debug, PartialEq)]
pub enum DecodingError {
    /// The bytes are not enough to decode the value.
    NotEnoughBytes {
        minimum: usize,
        actual: usize,
    },

    /// The frame continues after a complete top-level value.
    TrailingBytes(usize),

    /// Marker 0xc1 is never used in MessagePack.
    ReservedMarker(u8),

    /// Extension types are not used by any publisher feeding this library.
    UnsupportedExtension(u8),

    /// A string is not valid UTF-8.
    InvalidUtf8,

    NestingTooDeep,
}

impl Display for DecodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NotEnoughBytes { minimum, actual } => &format!(
                "not enough bytes available, at minimum {minimum} bytes are expected but got {actual} bytes"
            ),
            Self::TrailingBytes(count) => {
                &format!("{count} bytes left over after a complete value")
            }
            Self::ReservedMarker(marker) => &format!("marker {marker:#04x} is reserved"),
            Self::UnsupportedExtension(marker) => {
                &format!("extension marker {marker:#04x} is not supported")
            }
            Self::InvalidUtf8 => "string is not valid UTF-8",
            Self::NestingTooDeep => &format!("value nests deeper than {MAX_DEPTH} levels"),
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for DecodingError {}

/// Decode one complete frame as a [`Value`].
///
/// The whole slice must be consumed; bytes left over after the first
/// top-level value fail with [`DecodingError::TrailingBytes`].
///
/// # Example
///
/// ```
/// use sterne::{decode, Value};
///
/// // {"a": 7} as MessagePack: fixmap(1), fixstr "a", fixint 7.
/// let frame = [0x81, 0xa1, b'a', 0x07];
/// let value = decode::value(&frame).unwrap();
/// assert_eq!(value, Value::Map(vec![(Value::from("a"), Value::Int(7))]));
/// ```
pub fn value(bytes: &[u8]) -> Result<Value, DecodingError> {
    let (value, consumed) = read_value(bytes, 0)?;
    if consumed != bytes.len() {
        return Err(DecodingError::TrailingBytes(bytes.len() - consumed));
    }
    Ok(value)
}

// Parse the next value. Returns the value and the number of bytes consumed,
// including the marker byte.
fn read_value(bytes: &[u8], depth: usize) -> Result<(Value, usize), DecodingError> {
    if depth > MAX_DEPTH {
        return Err(DecodingError::NestingTooDeep);
    }

    let marker = *bytes.first().ok_or(DecodingError::NotEnoughBytes {
        minimum: 1,
        actual: 0,
    })?;
    let rest = &bytes[1..];

    match marker {
        // positive fixint
        0x00..=0x7f => Ok((Value::Int(marker as i64), 1)),
        // fixmap
        0x80..=0x8f => with_prefix(read_map(rest, (marker & 0x0f) as usize, depth), 1),
        // fixarray
        0x90..=0x9f => with_prefix(read_array(rest, (marker & 0x0f) as usize, depth), 1),
        // fixstr
        0xa0..=0xbf => with_prefix(read_str(rest, (marker & 0x1f) as usize), 1),
        0xc0 => Ok((Value::Nil, 1)),
        0xc1 => Err(DecodingError::ReservedMarker(marker)),
        0xc2 => Ok((Value::Bool(false), 1)),
        0xc3 => Ok((Value::Bool(true), 1)),
        // bin 8/16/32
        0xc4 => {
            let length = u8(rest)? as usize;
            with_prefix(read_bin(&rest[1..], length), 2)
        }
        0xc5 => {
            let length = u16(rest)? as usize;
            with_prefix(read_bin(&rest[2..], length), 3)
        }
        0xc6 => {
            let length = u32(rest)? as usize;
            with_prefix(read_bin(&rest[4..], length), 5)
        }
        0xc7..=0xc9 => Err(DecodingError::UnsupportedExtension(marker)),
        0xca => Ok((Value::F64(f32::from_be_bytes(be4(rest)?) as f64), 5)),
        0xcb => Ok((Value::F64(f64::from_be_bytes(be8(rest)?)), 9)),
        0xcc => Ok((Value::Int(u8(rest)? as i64), 2)),
        0xcd => Ok((Value::Int(u16(rest)? as i64), 3)),
        0xce => Ok((Value::Int(u32(rest)? as i64), 5)),
        0xcf => {
            let value = u64::from_be_bytes(be8(rest)?);
            match i64::try_from(value) {
                Ok(value) => Ok((Value::Int(value), 9)),
                Err(_) => Ok((Value::UInt(value), 9)),
            }
        }
        0xd0 => Ok((Value::Int(u8(rest)? as i8 as i64), 2)),
        0xd1 => Ok((Value::Int(i16::from_be_bytes(be2(rest)?) as i64), 3)),
        0xd2 => Ok((Value::Int(i32::from_be_bytes(be4(rest)?) as i64), 5)),
        0xd3 => Ok((Value::Int(i64::from_be_bytes(be8(rest)?)), 9)),
        // fixext 1/2/4/8/16
        0xd4..=0xd8 => Err(DecodingError::UnsupportedExtension(marker)),
        // str 8/16/32
        0xd9 => {
            let length = u8(rest)? as usize;
            with_prefix(read_str(&rest[1..], length), 2)
        }
        0xda => {
            let length = u16(rest)? as usize;
            with_prefix(read_str(&rest[2..], length), 3)
        }
        0xdb => {
            let length = u32(rest)? as usize;
            with_prefix(read_str(&rest[4..], length), 5)
        }
        // array 16/32
        0xdc => {
            let count = u16(rest)? as usize;
            with_prefix(read_array(&rest[2..], count, depth), 3)
        }
        0xdd => {
            let count = u32(rest)? as usize;
            with_prefix(read_array(&rest[4..], count, depth), 5)
        }
        // map 16/32
        0xde => {
            let count = u16(rest)? as usize;
            with_prefix(read_map(&rest[2..], count, depth), 3)
        }
        0xdf => {
            let count = u32(rest)? as usize;
            with_prefix(read_map(&rest[4..], count, depth), 5)
        }
        // negative fixint
        0xe0..=0xff => Ok((Value::Int(marker as i8 as i64), 1)),
    }
}

// Add the bytes taken by the marker and length prefix to the consumed count.
fn with_prefix(
    result: Result<(Value, usize), DecodingError>,
    prefix: usize,
) -> Result<(Value, usize), DecodingError> {
    result.map(|(value, consumed)| (value, consumed + prefix))
}

fn read_str(bytes: &[u8], length: usize) -> Result<(Value, usize), DecodingError> {
    let data = take(bytes, length)?;
    let text = std::str::from_utf8(data).map_err(|_| DecodingError::InvalidUtf8)?;
    Ok((Value::Str(text.to_string()), length))
}

fn read_bin(bytes: &[u8], length: usize) -> Result<(Value, usize), DecodingError> {
    let data = take(bytes, length)?;
    Ok((Value::Bin(data.to_vec()), length))
}

fn read_array(bytes: &[u8], count: usize, depth: usize) -> Result<(Value, usize), DecodingError> {
    // No `with_capacity(count)`: the count comes off the wire and a corrupt
    // frame could claim billions of elements.
    let mut items = Vec::new();
    let mut offset = 0;

    for _ in 0..count {
        let (item, consumed) = read_value(&bytes[offset..], depth + 1)?;
        offset += consumed;
        items.push(item);
    }
    Ok((Value::Array(items), offset))
}

fn read_map(bytes: &[u8], count: usize, depth: usize) -> Result<(Value, usize), DecodingError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    for _ in 0..count {
        let (key, consumed) = read_value(&bytes[offset..], depth + 1)?;
        offset += consumed;
        let (value, consumed) = read_value(&bytes[offset..], depth + 1)?;
        offset += consumed;
        entries.push((key, value));
    }
    Ok((Value::Map(entries), offset))
}

fn take(bytes: &[u8], count: usize) -> Result<&[u8], DecodingError> {
    bytes.get(..count).ok_or(DecodingError::NotEnoughBytes {
        minimum: count,
        actual: bytes.len(),
    })
}

fn u8(bytes: &[u8]) -> Result<u8, DecodingError> {
    Ok(take(bytes, 1)?[0])
}

fn u16(bytes: &[u8]) -> Result<u16, DecodingError> {
    Ok(u16::from_be_bytes(be2(bytes)?))
}

fn u32(bytes: &[u8]) -> Result<u32, DecodingError> {
    Ok(u32::from_be_bytes(be4(bytes)?))
}

fn be2(bytes: &[u8]) -> Result<[u8; 2], DecodingError> {
    let bytes = take(bytes, 2)?;
    Ok([bytes[0], bytes[1]])
}

fn be4(bytes: &[u8]) -> Result<[u8; 4], DecodingError> {
    let bytes = take(bytes, 4)?;
    Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be8(bytes: &[u8]) -> Result<[u8; 8], DecodingError> {
    let bytes = take(bytes, 8)?;
    Ok([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
