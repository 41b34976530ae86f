//! Payload codec for capped-store records.
//!
//! Uses bincode with an explicit config so writers and readers always agree on
//! the encoding (fixint for lengths and enums). Every payload starts with a
//! one-byte format version; trailing bytes are rejected so a record that was
//! partially overwritten cannot decode as something plausible.
//!
//! Lists are written as a sequence of `[u32 little-endian length][bincode]`
//! frames after the version byte.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Payload format version
pub const PAYLOAD_VERSION: u8 = 1;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,
    #[error("unsupported payload version {0}")]
    Version(u8),
    #[error("truncated frame at offset {0}")]
    Truncated(usize),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

fn payload_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new().with_fixint_encoding()
}

/// Encode a single value.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![PAYLOAD_VERSION];
    payload_bincode().serialize_into(&mut out, value)?;
    Ok(out)
}

/// Decode a single value written by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let body = check_version(bytes)?;
    Ok(payload_bincode().deserialize(body)?)
}

/// Encode a list as length-delimited frames.
pub fn encode_delimited<T: Serialize>(values: &[T]) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![PAYLOAD_VERSION];
    for value in values {
        let frame = payload_bincode().serialize(value)?;
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame);
    }
    Ok(out)
}

/// Decode a list written by [`encode_delimited`].
pub fn decode_delimited<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>, CodecError> {
    let body = check_version(bytes)?;
    let mut values = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        if offset + LENGTH_PREFIX > body.len() {
            return Err(CodecError::Truncated(offset));
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&body[offset..offset + LENGTH_PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = offset + LENGTH_PREFIX;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= body.len())
            .ok_or(CodecError::Truncated(offset))?;
        values.push(payload_bincode().deserialize(&body[start..end])?);
        offset = end;
    }
    Ok(values)
}

fn check_version(bytes: &[u8]) -> Result<&[u8], CodecError> {
    match bytes.split_first() {
        None => Err(CodecError::Empty),
        Some((&PAYLOAD_VERSION, body)) => Ok(body),
        Some((&other, _)) => Err(CodecError::Version(other)),
    }
}
