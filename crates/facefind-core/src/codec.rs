//! Persisted embedding encodings.
//!
//! New records are written in a length-prefixed little-endian binary form:
//!
//! ```text
//! b"FEMB" | count: u32 LE | count × f32 LE
//! ```
//!
//! Older databases hold comma-joined decimal text (`"0.12,-0.5,..."`). Both are
//! accepted by [`decode_vector`]; the form is picked by the magic prefix.

use thiserror::Error;

pub const BINARY_MAGIC: &[u8; 4] = b"FEMB";
const HEADER_LEN: usize = BINARY_MAGIC.len() + std::mem::size_of::<u32>();

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("binary vector truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("binary vector has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("text vector is not valid UTF-8")]
    NotUtf8,
    #[error("text vector item {index} is not a number: {item:?}")]
    BadNumber { index: usize, item: String },
    #[error("vector contains a non-finite value at index {0}")]
    NonFinite(usize),
}

/// Which persisted form a stored vector uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    LegacyText,
}

/// Detect the encoding of a stored vector from its bytes.
pub fn detect(raw: &[u8]) -> Encoding {
    if raw.starts_with(BINARY_MAGIC) {
        Encoding::Binary
    } else {
        Encoding::LegacyText
    }
}

/// Encode a vector in the canonical binary form.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + std::mem::size_of_val(values));
    out.extend_from_slice(BINARY_MAGIC);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Encode a vector in the legacy comma-joined text form.
///
/// `f32`'s `Display` prints the shortest string that parses back to the same
/// value, so text and binary copies of one vector decode identically.
pub fn encode_legacy_text(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode a stored vector, whichever form it was written in.
pub fn decode_vector(raw: &[u8]) -> Result<Vec<f32>, CodecError> {
    let values = match detect(raw) {
        Encoding::Binary => decode_binary(raw)?,
        Encoding::LegacyText => decode_text(raw)?,
    };

    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(index));
    }
    Ok(values)
}

fn decode_binary(raw: &[u8]) -> Result<Vec<f32>, CodecError> {
    let Some(count_bytes) = raw.get(BINARY_MAGIC.len()..HEADER_LEN) else {
        return Err(CodecError::Truncated { expected: HEADER_LEN, actual: raw.len() });
    };
    let count = u32::from_le_bytes([count_bytes[0], count_bytes[1], count_bytes[2], count_bytes[3]]) as usize;

    let body = &raw[HEADER_LEN..];
    let expected = count.saturating_mul(std::mem::size_of::<f32>());
    if body.len() < expected {
        return Err(CodecError::Truncated {
            expected: HEADER_LEN.saturating_add(expected),
            actual: raw.len(),
        });
    }
    if body.len() > expected {
        return Err(CodecError::TrailingBytes(body.len() - expected));
    }

    Ok(body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_text(raw: &[u8]) -> Result<Vec<f32>, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    text.split(',')
        .enumerate()
        .map(|(index, item)| {
            item.trim().parse::<f32>().map_err(|_| CodecError::BadNumber {
                index,
                item: item.to_string(),
            })
        })
        .collect()
}
