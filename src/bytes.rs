//! Hex field decoding.
//!
//! Provider fields arrive as `0x`-prefixed hex strings. The decoded length is
//! the minimum number of big-endian bytes needed to hold the numeric value, so
//! leading zero bytes of the original field are dropped.

use alloy_primitives::hex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractError {
    /// Absent field or zero value: nothing to inspect.
    #[error("empty input, no payload to inspect")]
    EmptyInput,

    #[error("invalid hex field: {0}")]
    InvalidHex(String),
}

impl ExtractError {
    /// Empty payloads are skipped silently by every caller.
    pub fn is_empty_input(&self) -> bool {
        matches!(self, ExtractError::EmptyInput)
    }
}

/// Decode a provider hex field into its minimal big-endian byte sequence.
pub fn to_bytes(field: Option<&str>) -> Result<Vec<u8>, ExtractError> {
    let raw = field.map(str::trim).unwrap_or_default();
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);

    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(ExtractError::InvalidHex(format!(
            "unexpected character {bad:?} in {raw:?}"
        )));
    }

    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Err(ExtractError::EmptyInput);
    }

    let decoded = if significant.len() % 2 == 1 {
        hex::decode(format!("0{significant}"))
    } else {
        hex::decode(significant)
    };

    decoded.map_err(|e| ExtractError::InvalidHex(e.to_string()))
}

/// Same rules as [`to_bytes`] applied to an already decoded word, e.g. a
/// 32-byte storage slot or a 20-byte address.
pub fn trim_word(word: &[u8]) -> Result<Vec<u8>, ExtractError> {
    match word.iter().position(|b| *b != 0) {
        Some(first) => Ok(word[first..].to_vec()),
        None => Err(ExtractError::EmptyInput),
    }
}
