//! Binary protocol for the networked Ephemeral Registry.
//!
//! Every frame is one bincode-encoded `RegistryMessage` carried in a
//! WebSocket binary message. Client requests carry a `seq` that the server
//! echoes in an `Ack` or `Error`; requests on one connection are applied
//! in the order they were sent.
//!
//! ```text
//! client                         server
//!   │── OnDisconnect{seq:1} ──────▶│  arm binding
//!   │◀───────────── Ack{seq:1} ────│
//!   │── Set{seq:2} ───────────────▶│  write + fan-out
//!   │◀───────────── Ack{seq:2} ────│
//!   │◀── Snapshot{namespace,..} ───│  to every subscriber
//! ```

use easel_core::CollabError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{DisconnectAction, RegistrySnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryMessage {
    Set {
        seq: u64,
        namespace: String,
        key: String,
        value: Vec<u8>,
    },
    Remove {
        seq: u64,
        namespace: String,
        key: String,
    },
    OnDisconnect {
        seq: u64,
        namespace: String,
        key: String,
        action: DisconnectAction,
    },
    CancelOnDisconnect {
        seq: u64,
        namespace: String,
        key: String,
    },
    /// The first `Snapshot` for the namespace follows the `Ack`.
    Subscribe { seq: u64, namespace: String },
    Unsubscribe { namespace: String },
    Ack { seq: u64 },
    Error { seq: u64, message: String },
    /// Full contents of a namespace after a change.
    Snapshot {
        namespace: String,
        entries: RegistrySnapshot,
    },
    Ping,
    Pong,
}

impl RegistryMessage {
    /// Sequence number of a request or its reply.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Set { seq, .. }
            | Self::Remove { seq, .. }
            | Self::OnDisconnect { seq, .. }
            | Self::CancelOnDisconnect { seq, .. }
            | Self::Subscribe { seq, .. }
            | Self::Ack { seq }
            | Self::Error { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Whether the server answers this message with `Ack` or `Error`.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Self::Set { .. }
                | Self::Remove { .. }
                | Self::OnDisconnect { .. }
                | Self::CancelOnDisconnect { .. }
                | Self::Subscribe { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Remove { .. } => "remove",
            Self::OnDisconnect { .. } => "on_disconnect",
            Self::CancelOnDisconnect { .. } => "cancel_on_disconnect",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::Snapshot { .. } => "snapshot",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::StoreUnavailable(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let msg = RegistryMessage::OnDisconnect {
            seq: 7,
            namespace: "presence".into(),
            key: "alice".into(),
            action: DisconnectAction::Set(vec![1, 2, 3]),
        };
        let decoded = RegistryMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.seq(), Some(7));
        assert!(decoded.expects_reply());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut entries = RegistrySnapshot::new();
        entries.insert("alice".into(), vec![9; 32]);
        entries.insert("bob".into(), Vec::new());
        let msg = RegistryMessage::Snapshot {
            namespace: "cursors".into(),
            entries,
        };
        let decoded = RegistryMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.seq(), None);
        assert!(!decoded.expects_reply());
    }

    #[test]
    fn test_heartbeat_frames_are_small() {
        let ping = RegistryMessage::Ping.encode().unwrap();
        let pong = RegistryMessage::Pong.encode().unwrap();
        assert!(ping.len() <= 2);
        assert_eq!(RegistryMessage::decode(&pong).unwrap(), RegistryMessage::Pong);
    }

    #[test]
    fn test_cursor_set_size() {
        let msg = RegistryMessage::Set {
            seq: 1_000,
            namespace: "cursors".into(),
            key: "user-1234".into(),
            value: vec![0; 24],
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 64, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_decode_garbage() {
        let err = RegistryMessage::decode(&[0xFF, 0xFE, 0xFD]).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_error_maps_to_store_unavailable() {
        let err: CollabError = ProtocolError::ConnectionClosed.into();
        assert!(err.is_recoverable());
        assert!(matches!(err, CollabError::StoreUnavailable(_)));
    }

    #[test]
    fn test_kinds() {
        assert_eq!(RegistryMessage::Ping.kind(), "ping");
        assert_eq!(RegistryMessage::Unsubscribe { namespace: "x".into() }.kind(), "unsubscribe");
        assert_eq!(RegistryMessage::Ack { seq: 1 }.seq(), Some(1));
    }
}
