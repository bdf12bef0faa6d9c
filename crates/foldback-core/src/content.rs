//! Base64 serde adapter for opaque entry content.
//!
//! Content is a byte-accurate blob; encoding it as base64 keeps arbitrary
//! bytes intact inside JSON frames and journal lines.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

/// Encode bytes as a base64 string.
#[must_use]
pub fn encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a base64 string.
///
/// # Errors
/// Returns error if `data` is not valid base64.
pub fn decode(data: &str) -> Result<Bytes, base64::DecodeError> {
    BASE64.decode(data).map(Bytes::from)
}

/// Serialize as base64.
///
/// # Errors
/// Propagates serializer errors.
pub fn serialize<S: Serializer>(content: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode(content))
}

/// Deserialize from base64.
///
/// # Errors
/// Fails on non-string input or invalid base64.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let raw = String::deserialize(deserializer)?;
    decode(&raw).map_err(D::Error::custom)
}
