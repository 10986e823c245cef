//! Coercion of decoded frames into string-keyed payload maps.
//!
//! Every byte frame crossing into a pipeline passes through
//! [`from_bytes`]. Everything downstream of it (the defragmenter, the
//! validator) only ever sees a [`Payload`].
use crate::decode::{self, DecodingError};
use crate::Value;
use indexmap::IndexMap;
use std::fmt::Display;

/// A decoded frame: field names mapped to dynamically typed values.
///
/// The map keeps insertion order, so overlaying payloads on top of each
/// other yields a deterministic field order.
pub type Payload = IndexMap<String, Value>;

#[derive(Debug, PartialEq)]
pub enum CoercionError {
    /// The top-level value of the frame is not a map.
    NotAMapping(&'static str),

    /// A map key is neither a string nor UTF-8 binary.
    BadKeyType(&'static str),
}

impl Display for CoercionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NotAMapping(kind) => &format!("expected frame to be a map, got {kind}"),
            Self::BadKeyType(kind) => &format!("expected map key to be a string, got {kind}"),
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for CoercionError {}

/// Why a frame could not be turned into a [`Payload`].
#[derive(Debug, PartialEq)]
pub enum PayloadError {
    Decoding(DecodingError),
    Coercion(CoercionError),
}

impl Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decoding(error) => write!(f, "{error}"),
            Self::Coercion(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<DecodingError> for PayloadError {
    fn from(value: DecodingError) -> Self {
        Self::Decoding(value)
    }
}

impl From<CoercionError> for PayloadError {
    fn from(value: CoercionError) -> Self {
        Self::Coercion(value)
    }
}

/// Decode a broker frame and coerce its top level into a [`Payload`].
pub fn from_bytes(bytes: &[u8]) -> Result<Payload, PayloadError> {
    let value = decode::value(bytes)?;
    Ok(coerce_mapping(value)?)
}

/// Coerce a decoded [`Value`] into a [`Payload`].
///
/// Keys arriving as binary are normalised to text; anything else that is
/// not already a string fails with [`CoercionError::BadKeyType`]. When the
/// same key appears twice, the later entry wins.
pub fn coerce_mapping(value: Value) -> Result<Payload, CoercionError> {
    let entries = match value {
        Value::Map(entries) => entries,
        other => return Err(CoercionError::NotAMapping(other.kind())),
    };

    let mut payload = Payload::with_capacity(entries.len());
    for (key, value) in entries {
        payload.insert(coerce_key(key)?, value);
    }
    Ok(payload)
}

fn coerce_key(key: Value) -> Result<String, CoercionError> {
    match key {
        Value::Str(key) => Ok(key),
        Value::Bin(bytes) => {
            String::from_utf8(bytes).map_err(|_| CoercionError::BadKeyType("binary"))
        }
        other => Err(CoercionError::BadKeyType(other.kind())),
    }
}
