//! Opaque, totally ordered version tokens.
//!
//! Every document write, attachment write, and tombstone in the local store
//! carries an [`Etag`]. Etags compare byte-wise, have a least element
//! ([`Etag::ZERO`]), and render as a fixed-width hex string. The agent never
//! fabricates etags - it only compares and forwards tokens minted by the
//! storage layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 16-byte version token, ordered by its big-endian byte sequence.
///
/// Comparison is the plain lexicographic order of the bytes, which is what
/// peers rely on when acknowledging cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Etag([u8; 16]);

impl Etag {
    /// The least element: all zero bytes. Cursor negotiation starts here
    /// for a peer that has never acknowledged anything.
    pub const ZERO: Etag = Etag([0u8; 16]);

    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Etag(bytes)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Construct from two 64-bit halves (high half dominates ordering).
    ///
    /// Test fixtures use `Etag::from_parts(0, n)` to mint ascending tokens.
    pub fn from_parts(high: u64, low: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&high.to_be_bytes());
        bytes[8..].copy_from_slice(&low.to_be_bytes());
        Etag(bytes)
    }

    /// True for the least element.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Parse the 32-character hex form.
    pub fn parse(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; 16] = decoded.try_into().ok()?;
        Some(Etag(bytes))
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Etag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Etag::parse(s).ok_or_else(|| format!("invalid etag: {:?}", s))
    }
}

impl Serialize for Etag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Etag::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid etag: {:?}", s)))
    }
}
