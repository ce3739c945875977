//! Core types for peermq

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MqError;

/// Context string mixed into every discovery key derivation
const DISCOVERY_CONTEXT: &[u8] = b"peermq discovery key v1";

/// A mailbox address: the 32-byte ed25519 public key of a node's log identity.
///
/// Rendered as 64 lowercase hex characters at process boundaries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create a PeerId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse either 32 raw bytes or their 64-character hex encoding.
    ///
    /// Anything else is rejected with `MqError::InvalidKey`.
    pub fn from_key(input: &[u8]) -> Result<Self, MqError> {
        match input.len() {
            32 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(input);
                Ok(Self(arr))
            }
            64 => {
                let mut arr = [0u8; 32];
                hex::decode_to_slice(input, &mut arr)
                    .map_err(|e| MqError::InvalidKey(format!("bad hex: {}", e)))?;
                Ok(Self(arr))
            }
            n => Err(MqError::InvalidKey(format!(
                "expected 32 bytes or 64 hex characters, got {} bytes",
                n
            ))),
        }
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Derive the discovery key announced on the wire for this public key.
    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey::derive(self)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(MqError::InvalidKey(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        Self::from_key(s.as_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// One-way value derived from a public key.
///
/// Announced during the handshake so that network-level peer matching
/// does not reveal the public key itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey(pub [u8; 32]);

impl DiscoveryKey {
    /// Derive the discovery key for a public key
    pub fn derive(peer: &PeerId) -> Self {
        Self(*blake3::keyed_hash(peer.as_bytes(), DISCOVERY_CONTEXT).as_bytes())
    }

    /// Parse 32 raw bytes or 64 hex characters
    pub fn from_key(input: &[u8]) -> Result<Self, MqError> {
        PeerId::from_key(input).map(|id| Self(id.0))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", hex::encode(&self.0[..4]))
    }
}

/// A message surfaced by a read stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Author of the message (the peer whose send-log it came from)
    pub from: PeerId,
    /// Position in the author's log
    pub seq: u64,
    /// Raw message bytes
    pub data: Bytes,
}

/// Consumption lens used by `create_read_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    /// Messages not yet read (and not deleted)
    Unread,
    /// Messages that were archived
    Archive,
    /// Messages that were read
    Read,
}

impl View {
    /// Name used at the API boundary
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Unread => "unread",
            View::Archive => "archive",
            View::Read => "read",
        }
    }
}

impl FromStr for View {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(View::Unread),
            "archive" => Ok(View::Archive),
            "read" => Ok(View::Read),
            other => Err(MqError::UnsupportedView(other.to_string())),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `create_read_stream`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Keep the stream open and emit messages as they arrive
    pub live: bool,
}

impl ReadOptions {
    /// Live-tailing options
    pub fn live() -> Self {
        Self { live: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_raw_and_hex() {
        let raw = [7u8; 32];
        let from_raw = PeerId::from_key(&raw).unwrap();
        let from_hex = PeerId::from_key(hex::encode(raw).as_bytes()).unwrap();
        assert_eq!(from_raw, from_hex);
        assert_eq!(from_raw.to_string(), "07".repeat(32));
    }

    #[test]
    fn test_peer_id_rejects_bad_lengths() {
        assert!(matches!(PeerId::from_key(&[1u8; 31]), Err(MqError::InvalidKey(_))));
        assert!(matches!(PeerId::from_key(&[1u8; 33]), Err(MqError::InvalidKey(_))));
        assert!(matches!("abcd".parse::<PeerId>(), Err(MqError::InvalidKey(_))));
    }

    #[test]
    fn test_peer_id_rejects_non_hex() {
        let bad = "zz".repeat(32);
        assert!(matches!(bad.parse::<PeerId>(), Err(MqError::InvalidKey(_))));
    }

    #[test]
    fn test_discovery_key_is_deterministic_and_distinct() {
        let a = PeerId([1u8; 32]);
        let b = PeerId([2u8; 32]);
        assert_eq!(a.discovery_key(), a.discovery_key());
        assert_ne!(a.discovery_key(), b.discovery_key());
        assert_ne!(a.discovery_key().0, a.0);
    }

    #[test]
    fn test_view_parse() {
        assert_eq!("unread".parse::<View>().unwrap(), View::Unread);
        assert_eq!("archive".parse::<View>().unwrap(), View::Archive);
        assert_eq!("read".parse::<View>().unwrap(), View::Read);
        assert!(matches!("inbox".parse::<View>(), Err(MqError::UnsupportedView(_))));
    }
}
