//! Control message types

use crate::target::Target;
use crate::ProtoError;
use serde::{Deserialize, Serialize};

/// Why the relay refused a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    /// The bearer credential was rejected; the caller must reacquire one.
    InvalidCredential,
    /// The authorization policy refused access to the target.
    AccessDenied,
    /// The relay cannot serve the target right now.
    Unavailable(String),
}

/// Control messages exchanged on stream 0.
///
/// Data and Close frames carry the per-stream byte flow directly; only
/// handshake and stream lifecycle negotiation go through this enum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    /// Client opens the connection: identifies the target and presents
    /// the opaque bearer credential.
    ClientHello {
        version: u32,
        target: Target,
        bearer_token: String,
    },
    /// Relay accepted the handshake.
    ServerHello { session_id: String },
    /// Relay refused the handshake.
    Refused { reason: RefusalReason },

    /// Client requests a new logical stream to the target.
    OpenStream { stream_id: u32 },
    /// Relay confirmed the stream is connected end to end.
    StreamOpened { stream_id: u32 },
    /// Relay could not connect the stream (e.g., destination unreachable).
    StreamRefused { stream_id: u32, reason: String },

    // Liveness (relay-initiated; the client answers)
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl RelayMessage {
    /// Encode for transmission as a control frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        bincode::serialize(self).map_err(|e| ProtoError::Codec(e.to_string()))
    }

    /// Decode a control frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        bincode::deserialize(payload).map_err(|e| ProtoError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_round_trip() {
        let msg = RelayMessage::ClientHello {
            version: crate::PROTOCOL_VERSION,
            target: Target::new("proj", "zone", "vm-1", 3389),
            bearer_token: "ya29.token".to_string(),
        };

        let encoded = msg.encode().unwrap();
        let decoded = RelayMessage::decode(&encoded).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_refused_reasons_distinct() {
        let cred = RelayMessage::Refused {
            reason: RefusalReason::InvalidCredential,
        };
        let authz = RelayMessage::Refused {
            reason: RefusalReason::AccessDenied,
        };

        let cred = RelayMessage::decode(&cred.encode().unwrap()).unwrap();
        let authz = RelayMessage::decode(&authz.encode().unwrap()).unwrap();
        assert_ne!(cred, authz);
    }

    #[test]
    fn test_garbage_payload_is_codec_error() {
        let result = RelayMessage::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(ProtoError::Codec(_))));
    }
}
