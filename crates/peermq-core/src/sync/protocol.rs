//! Mailbox replication wire protocol
//!
//! Messages are serialized with postcard and carried in length-delimited
//! frames (see [`super::framing`]).
//!
//! ## Message Flow
//!
//! The connecting side owns the log being replicated (its send-log to the
//! acceptor); the accepting side mirrors it.
//!
//! ```text
//! Connector (author)                 Acceptor (mirror)
//!   |<-- Challenge {nonce} -----------|  fresh per stream
//!   |--- Hello {dk, tkey, nonce, ---->|  resolve dk in directory, verify proof
//!   |          proof}                 |  over the acceptor's nonce
//!   |<-- Welcome {tkey, proof} -------|  proof over the connector's nonce
//!   |                                 |
//!   |--- Have {length} -------------->|  remote length watermark
//!   |<-- Request {seq} ---------------|  only slots a reader asked for
//!   |--- Data {seq, data, sig} ------>|  verified and stored
//!   |<-- Ack {seq} -------------------|
//!   |--- Missing {seq} -------------->|  slot not available
//! ```

use serde::{Deserialize, Serialize};

use crate::error::MqResult;
use crate::types::DiscoveryKey;

/// Frames exchanged on a replication stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Opening frame from the acceptor: random bytes the Hello proof must cover
    Challenge { nonce: [u8; 32] },

    /// Connector's answer to the challenge
    Hello {
        /// Discovery key of the log the connector offers
        discovery_key: DiscoveryKey,
        /// Connector's transport public key
        transport_key: [u8; 32],
        /// Random bytes the Welcome proof must cover
        nonce: [u8; 32],
        /// Log-key signature over the transport key, the discovery key and
        /// the acceptor's challenge
        proof: Vec<u8>,
    },

    /// Acceptor's reply once the connector is authorized
    Welcome {
        transport_key: [u8; 32],
        proof: Vec<u8>,
    },

    /// Author's current log length
    Have { length: u64 },

    /// Mirror asks for one slot
    Request { seq: u64 },

    /// One signed entry
    Data {
        seq: u64,
        data: Vec<u8>,
        signature: Vec<u8>,
    },

    /// Author cannot serve the slot
    Missing { seq: u64 },

    /// Mirror stored the slot
    Ack { seq: u64 },
}

impl WireMessage {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> MqResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode message from bytes using postcard
    pub fn decode(data: &[u8]) -> MqResult<Self> {
        Ok(postcard::from_bytes(data)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Challenge { .. } => "challenge",
            WireMessage::Hello { .. } => "hello",
            WireMessage::Welcome { .. } => "welcome",
            WireMessage::Have { .. } => "have",
            WireMessage::Request { .. } => "request",
            WireMessage::Data { .. } => "data",
            WireMessage::Missing { .. } => "missing",
            WireMessage::Ack { .. } => "ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqError;

    #[test]
    fn test_data_message_roundtrip() {
        let msg = WireMessage::Data {
            seq: 7,
            data: b"hello".to_vec(),
            signature: vec![1u8; 64],
        };
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "data");
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = WireMessage::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, MqError::Serialization(_)));
    }
}
