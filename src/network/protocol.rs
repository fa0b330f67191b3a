//! Cluster Wire Protocol
//!
//! Messages exchanged between cluster clients and the RPC server.

use serde::{Deserialize, Serialize};

use crate::distro::data::{SyncKey, SyncPayload};

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Connection ==========
    /// Handshake sent when a cluster client connects
    ServerCheck {
        connection_id: String,
    },

    /// Handshake response
    ServerCheckResponse {
        address: String,
    },

    /// Liveness check on an established connection
    HeartBeat {
        connection_id: String,
    },

    /// Liveness check response
    HeartBeatResponse,

    // ========== Distro ==========
    /// Push data (sync, add/remove operations or checksum digest)
    DistroData {
        source: String,
        payload: SyncPayload,
    },

    /// Pull the named resources
    DistroQuery {
        key: SyncKey,
    },

    /// Pull the whole store
    DistroSnapshot,

    /// Response to any Distro request
    DistroResponse {
        success: bool,
        payload: Option<SyncPayload>,
        message: Option<String>,
    },

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Request type not understood
    Unsupported,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Successful Distro response
    pub fn ok(payload: Option<SyncPayload>) -> Self {
        Message::DistroResponse {
            success: true,
            payload,
            message: None,
        }
    }

    /// Failed Distro response
    pub fn failed(message: impl Into<String>) -> Self {
        Message::DistroResponse {
            success: false,
            payload: None,
            message: Some(message.into()),
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ServerCheck { .. } => "ServerCheck",
            Message::ServerCheckResponse { .. } => "ServerCheckResponse",
            Message::HeartBeat { .. } => "HeartBeat",
            Message::HeartBeatResponse => "HeartBeatResponse",
            Message::DistroData { .. } => "DistroData",
            Message::DistroQuery { .. } => "DistroQuery",
            Message::DistroSnapshot => "DistroSnapshot",
            Message::DistroResponse { .. } => "DistroResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest accepted body
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distro::data::DataOperation;

    #[test]
    fn test_distro_message_serialization() {
        let msg = Message::DistroData {
            source: "n1:7848".to_string(),
            payload: SyncPayload::new(SyncKey::Checksum, vec![1, 2, 3], DataOperation::Verify),
        };

        let bytes = msg.serialize().unwrap();
        match Message::deserialize(&bytes).unwrap() {
            Message::DistroData { source, payload } => {
                assert_eq!(source, "n1:7848");
                assert_eq!(payload.key, SyncKey::Checksum);
                assert_eq!(payload.operation, DataOperation::Verify);
                assert_eq!(payload.content, vec![1, 2, 3]);
            }
            other => panic!("Wrong message type: {}", other.type_name()),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
