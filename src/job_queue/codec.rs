//! Envelope for job payloads and results.
//!
//! The queue stores payloads as opaque bytes. Producers that want structured
//! payloads can use this envelope: one version byte, a big-endian `u32`
//! length, then the JSON body.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload truncated: {0} bytes")]
    Truncated(usize),

    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    #[error("payload length mismatch: header says {expected} bytes, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("payload is too large: {0} bytes")]
    TooLarge(usize),

    #[error("invalid payload JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| PayloadError::TooLarge(body.len()))?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.push(ENVELOPE_VERSION);
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadError> {
    if bytes.len() < HEADER_LEN {
        return Err(PayloadError::Truncated(bytes.len()));
    }
    if bytes[0] != ENVELOPE_VERSION {
        return Err(PayloadError::UnsupportedVersion(bytes[0]));
    }

    let expected = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != expected {
        return Err(PayloadError::LengthMismatch {
            expected,
            actual: body.len(),
        });
    }

    Ok(serde_json::from_slice(body)?)
}
