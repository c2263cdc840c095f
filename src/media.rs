//! Media call capability surface.
//!
//! Call negotiation and playback live outside this crate. The core only
//! needs to initiate a call toward a peer (`CallCapability`), accept the
//! stream a remote call produced, and keep streams associated with the
//! matching user by peer id. Stream contents are never inspected.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

/// Opaque handle to a negotiated remote media stream, keyed by the peer
/// it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub peer: Uuid,
    pub stream_id: Uuid,
}

impl MediaStream {
    pub fn new(peer: Uuid) -> Self {
        Self {
            peer,
            stream_id: Uuid::new_v4(),
        }
    }
}

/// Outbound call capability provided by the media collaborator.
#[async_trait]
pub trait CallCapability: Send + Sync {
    /// Dial `peer`, offering the local stream; resolves to the remote
    /// stream once the peer answers.
    async fn call(&self, peer: Uuid) -> Result<MediaStream, MediaError>;
}

/// Media call errors. Never fatal to data replication — the affected user
/// simply stays without a stream.
#[derive(Debug, Clone)]
pub enum MediaError {
    CallFailed { peer: Uuid, reason: String },
    NoLocalStream,
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CallFailed { peer, reason } => write!(f, "Call to {peer} failed: {reason}"),
            Self::NoLocalStream => write!(f, "No local media stream available"),
        }
    }
}

impl std::error::Error for MediaError {}

/// Streams currently associated with session users, at most one per peer.
/// A re-established call replaces the previous stream for that peer.
#[derive(Debug, Default)]
pub struct StreamDirectory {
    streams: HashMap<Uuid, MediaStream>,
}

impl StreamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a stream with its peer, returning the replaced stream if
    /// one was already attached.
    pub fn attach(&mut self, stream: MediaStream) -> Option<MediaStream> {
        self.streams.insert(stream.peer, stream)
    }

    /// Drop the stream for a departed peer.
    pub fn detach(&mut self, peer: Uuid) -> Option<MediaStream> {
        self.streams.remove(&peer)
    }

    pub fn get(&self, peer: Uuid) -> Option<&MediaStream> {
        self.streams.get(&peer)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn all(&self) -> Vec<MediaStream> {
        self.streams.values().cloned().collect()
    }
}
