//! Cache payload encoding
//!
//! Every stored payload is prefixed with a one-byte `Encoding` tag so decoding
//! is deterministic. JSON is tried first; values JSON cannot represent (e.g.
//! maps with composite keys) fall back to MessagePack.

use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Structured,
    Binary,
}

impl Encoding {
    const STRUCTURED_TAG: u8 = b'J';
    const BINARY_TAG: u8 = b'M';

    pub fn tag(self) -> u8 {
        match self {
            Encoding::Structured => Self::STRUCTURED_TAG,
            Encoding::Binary => Self::BINARY_TAG,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            Self::STRUCTURED_TAG => Some(Encoding::Structured),
            Self::BINARY_TAG => Some(Encoding::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CodecError {
    /// Neither encoding could represent the value
    Encode { structured: String, binary: String },
    Decode { encoding: Encoding, reason: String },
    Empty,
    UnknownTag(u8),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode { structured, binary } => write!(
                f,
                "value not encodable (json: {}; msgpack: {})",
                structured, binary
            ),
            Self::Decode { encoding, reason } => {
                write!(f, "failed to decode {:?} payload: {}", encoding, reason)
            }
            Self::Empty => write!(f, "empty payload"),
            Self::UnknownTag(t) => write!(f, "unknown encoding tag: 0x{:02X}", t),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode with the structured encoding, falling back to binary.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    let structured = match serde_json::to_vec(value) {
        Ok(body) => return Ok(framed(Encoding::Structured, body)),
        Err(e) => e.to_string(),
    };

    match rmp_serde::to_vec_named(value) {
        Ok(body) => {
            tracing::debug!(reason = %structured, "JSON encode failed; using msgpack");
            Ok(framed(Encoding::Binary, body))
        }
        Err(e) => Err(CodecError::Encode {
            structured,
            binary: e.to_string(),
        }),
    }
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (&tag, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    let encoding = Encoding::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

    match encoding {
        Encoding::Structured => serde_json::from_slice(body).map_err(|e| CodecError::Decode {
            encoding,
            reason: e.to_string(),
        }),
        Encoding::Binary => rmp_serde::from_slice(body).map_err(|e| CodecError::Decode {
            encoding,
            reason: e.to_string(),
        }),
    }
}

/// Tag of an encoded payload, if it carries a known one.
pub fn encoding_of(bytes: &[u8]) -> Option<Encoding> {
    bytes.first().copied().and_then(Encoding::from_tag)
}

fn framed(encoding: Encoding, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(encoding.tag());
    out.extend_from_slice(&body);
    out
}
