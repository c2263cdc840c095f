//! Binary wire protocol for scene replication.
//!
//! Wire shapes (bincode-encoded):
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ Hello   │ peer (16 bytes) + name                       │  handshake metadata
//! │ Batch   │ ordered list of Event                        │  floodable mutations
//! │ Others  │ list of { peer, name }                       │  hub → new spoke only
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! A `Batch` is the only frame a hub relays; ordering within a batch is
//! the sender's recording order and must survive relaying untouched.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single scene mutation, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Fresh-session reset: clears object state ahead of a snapshot replay.
    Init,
    /// Object moved or toggled. `owner` is the peer currently dragging it,
    /// if any.
    Move {
        object: u32,
        x: f32,
        y: f32,
        state: u8,
        owner: Option<Uuid>,
    },
    /// Membership: a peer is present under the given display name.
    User { peer: Uuid, name: String },
    /// Membership: a peer departed.
    Gone { peer: Uuid },
}

impl Event {
    /// The peer this event is about, for membership events.
    pub fn subject(&self) -> Option<Uuid> {
        match self {
            Event::User { peer, .. } | Event::Gone { peer } => Some(*peer),
            _ => None,
        }
    }
}

/// Peer identity with display metadata, as listed in membership snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer: Uuid,
    pub name: String,
}

/// Top-level frame exchanged on a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every link, both directions: the sender's identity
    /// and display name. Receipt of the remote `Hello` activates the link.
    Hello { peer: Uuid, name: String },
    /// An ordered batch of mutations.
    Batch(Vec<Event>),
    /// Membership snapshot sent to a newly joined spoke, listing every
    /// pre-existing participant (never the newcomer itself).
    Others(Vec<PeerSummary>),
}

impl Frame {
    /// A one-event batch announcing a newly joined peer.
    pub fn announce_user(peer: Uuid, name: impl Into<String>) -> Self {
        Frame::Batch(vec![Event::User {
            peer,
            name: name.into(),
        }])
    }

    /// A one-event batch announcing a departed peer.
    pub fn announce_gone(peer: Uuid) -> Self {
        Frame::Batch(vec![Event::Gone { peer }])
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let peer = Uuid::new_v4();
        let frame = Frame::Hello {
            peer,
            name: "Alice".into(),
        };

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_batch_roundtrip_preserves_order() {
        let owner = Uuid::new_v4();
        let events = vec![
            Event::Init,
            Event::Move {
                object: 3,
                x: 10.5,
                y: -2.0,
                state: 1,
                owner: Some(owner),
            },
            Event::Move {
                object: 3,
                x: 11.0,
                y: -2.5,
                state: 1,
                owner: Some(owner),
            },
            Event::Gone { peer: owner },
        ];

        let frame = Frame::Batch(events.clone());
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        match decoded {
            Frame::Batch(got) => assert_eq!(got, events),
            other => panic!("Expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn test_others_roundtrip() {
        let list = vec![
            PeerSummary {
                peer: Uuid::new_v4(),
                name: "Alice".into(),
            },
            PeerSummary {
                peer: Uuid::new_v4(),
                name: "Bob".into(),
            },
        ];

        let frame = Frame::Others(list.clone());
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();

        match decoded {
            Frame::Others(got) => assert_eq!(got, list),
            other => panic!("Expected Others, got {other:?}"),
        }
    }

    #[test]
    fn test_announce_helpers() {
        let peer = Uuid::new_v4();

        match Frame::announce_user(peer, "Carol") {
            Frame::Batch(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].subject(), Some(peer));
            }
            other => panic!("Expected Batch, got {other:?}"),
        }

        match Frame::announce_gone(peer) {
            Frame::Batch(events) => {
                assert_eq!(events, vec![Event::Gone { peer }]);
            }
            other => panic!("Expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn test_move_without_owner() {
        let frame = Frame::Batch(vec![Event::Move {
            object: 0,
            x: 0.0,
            y: 0.0,
            state: 0,
            owner: None,
        }]);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_subject_for_non_membership_events() {
        assert_eq!(Event::Init.subject(), None);
        let ev = Event::Move {
            object: 1,
            x: 1.0,
            y: 1.0,
            state: 0,
            owner: Some(Uuid::new_v4()),
        };
        assert_eq!(ev.subject(), None);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Frame::decode(&garbage).is_err());
    }

    #[test]
    fn test_empty_batch() {
        let frame = Frame::Batch(Vec::new());
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::Batch(events) => assert!(events.is_empty()),
            other => panic!("Expected Batch, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_size_efficient() {
        // A drag burst: 32 move events for one object.
        let events: Vec<Event> = (0..32)
            .map(|i| Event::Move {
                object: 7,
                x: i as f32,
                y: i as f32 * 2.0,
                state: 0,
                owner: None,
            })
            .collect();
        let encoded = Frame::Batch(events).encode().unwrap();

        // Each move is a handful of varint-packed fields; the whole burst
        // should stay well under a single MTU.
        assert!(
            encoded.len() < 1200,
            "Encoded size {} too large for a 32-move burst",
            encoded.len()
        );
    }
}
