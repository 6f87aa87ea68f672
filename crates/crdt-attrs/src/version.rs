//! Versioned update envelope.
//!
//! Every exported update is postcard-encoded state wrapped in a 3-byte
//! header, so that a receiver can reject foreign or future payloads before
//! attempting to decode them.
//!
//! ```text
//! [MAGIC: 0xA7][FORMAT VERSION: u8][PAYLOAD KIND: u8][PAYLOAD: N bytes]
//! ```

use serde::{de::DeserializeOwned, Serialize};

/// Magic byte identifying crdt-attrs updates.
pub const MAGIC_BYTE: u8 = 0xA7;

/// Current encoding version written by [`encode`].
pub const FORMAT_VERSION: u8 = 1;

/// Size of the envelope header in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 3;

/// What an update payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    /// A standalone replicated sequence.
    Sequence = 1,
    /// A whole document (elements, lists, maps and retired markers).
    Document = 2,
}

impl PayloadKind {
    /// Convert from a raw byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Sequence),
            2 => Some(Self::Document),
            _ => None,
        }
    }
}

/// Error encoding or decoding an update.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Data is too short to contain the header.
    #[error("data too short for update envelope")]
    TooShort,
    /// Missing or incorrect magic byte.
    #[error("invalid magic byte: 0x{0:02X}, expected 0xA7")]
    InvalidMagic(u8),
    /// Written by a newer encoder.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),
    /// Unknown payload kind byte.
    #[error("unknown payload kind: {0}")]
    UnknownKind(u8),
    /// Valid envelope, but not the kind the caller asked for.
    #[error("expected {expected:?} payload, found {found:?}")]
    UnexpectedKind {
        /// Kind the caller asked for.
        expected: PayloadKind,
        /// Kind found in the header.
        found: PayloadKind,
    },
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Encode(#[source] postcard::Error),
    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Decode(#[source] postcard::Error),
}

/// Parsed header of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Encoding version.
    pub version: u8,
    /// Payload kind.
    pub kind: PayloadKind,
    /// Payload size in bytes (excluding the header).
    pub payload_len: usize,
}

/// Read and validate the header of an update without decoding it.
pub fn peek(data: &[u8]) -> Result<EnvelopeHeader, CodecError> {
    if data.len() < ENVELOPE_HEADER_SIZE {
        return Err(CodecError::TooShort);
    }
    if data[0] != MAGIC_BYTE {
        return Err(CodecError::InvalidMagic(data[0]));
    }
    let version = data[1];
    if version == 0 || version > FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let kind = PayloadKind::from_byte(data[2]).ok_or(CodecError::UnknownKind(data[2]))?;

    Ok(EnvelopeHeader {
        version,
        kind,
        payload_len: data.len() - ENVELOPE_HEADER_SIZE,
    })
}

/// Serialize `value` and wrap it in an envelope of the given kind.
pub fn encode<T: Serialize + ?Sized>(kind: PayloadKind, value: &T) -> Result<Vec<u8>, CodecError> {
    let header = vec![MAGIC_BYTE, FORMAT_VERSION, kind as u8];
    postcard::to_extend(value, header).map_err(CodecError::Encode)
}

/// Validate the envelope and decode its payload as `T`.
pub fn decode<T: DeserializeOwned>(expected: PayloadKind, data: &[u8]) -> Result<T, CodecError> {
    let header = peek(data)?;
    if header.kind != expected {
        return Err(CodecError::UnexpectedKind {
            expected,
            found: header.kind,
        });
    }
    postcard::from_bytes(&data[ENVELOPE_HEADER_SIZE..]).map_err(CodecError::Decode)
}
