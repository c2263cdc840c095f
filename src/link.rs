//! Per-connection state machine and outbound queue.
//!
//! Every connection a role owns is wrapped in a [`Link`]: the remote peer's
//! identity, its display name from the connect-time metadata, an explicit
//! lifecycle state, and the sending half of the connection's outbound
//! queue. A dedicated writer task drains the queue into the socket, so the
//! role state machine never blocks on the network.
//!
//! Lifecycle:
//! ```text
//! Connecting ──Opened──► Open ──HandshakeReceived──► Active
//!     │                   │                            │
//!     └──────Closed/Errored──────────────────────────► Closed | Errored
//! ```
//!
//! [`LinkState::next`] is the single place lifecycle state changes; sends
//! on a non-`Active` link are guarded no-ops rather than errors.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{Frame, PeerSummary};

/// Sending half of a link's outbound queue. Frames are pre-encoded so a
/// flood shares one buffer across all receivers.
pub type LinkSender = mpsc::Sender<Arc<Vec<u8>>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Channel requested, not yet established.
    Connecting,
    /// Channel established; remote metadata not yet received.
    Open,
    /// Handshake complete — the link carries traffic.
    Active,
    /// Closed by either side.
    Closed,
    /// Failed; treated like `Closed` for delivery purposes.
    Errored,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    HandshakeReceived,
    Closed,
    Errored,
}

impl LinkState {
    /// The transition table. Terminal states absorb every event; out-of-
    /// order notifications (e.g. a handshake on a closed link) are inert.
    pub fn next(self, event: LinkEvent) -> LinkState {
        match (self, event) {
            (LinkState::Closed, _) => LinkState::Closed,
            (LinkState::Errored, _) => LinkState::Errored,
            (_, LinkEvent::Closed) => LinkState::Closed,
            (_, LinkEvent::Errored) => LinkState::Errored,
            (LinkState::Connecting, LinkEvent::Opened) => LinkState::Open,
            (LinkState::Open, LinkEvent::HandshakeReceived) => LinkState::Active,
            (state, _) => state,
        }
    }
}

/// A registered connection owned by a role.
#[derive(Debug)]
pub struct Link {
    peer: Uuid,
    name: String,
    state: LinkState,
    tx: LinkSender,
}

impl Link {
    /// Wrap an established channel. The link starts in `Open`; call
    /// [`Link::transition`] with `HandshakeReceived` once the remote's
    /// `Hello` metadata arrives.
    pub fn new(peer: Uuid, name: impl Into<String>, tx: LinkSender) -> Self {
        Self {
            peer,
            name: name.into(),
            state: LinkState::Open,
            tx,
        }
    }

    pub fn transition(&mut self, event: LinkEvent) {
        self.state = self.state.next(event);
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LinkState::Active
    }

    /// True once the connection's writer task is gone — the link can no
    /// longer deliver anything.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer: self.peer,
            name: self.name.clone(),
        }
    }

    /// Queue pre-encoded bytes for this link.
    ///
    /// Returns `false` without error when the link is not `Active`, the
    /// peer's queue is full (it is lagging), or its writer is gone — a
    /// failed send never aborts delivery to other links, and cleanup
    /// belongs to the close handler alone.
    pub fn send(&self, bytes: Arc<Vec<u8>>) -> bool {
        if !self.is_active() {
            log::debug!("Dropping send to {} link {}", state_name(self.state), self.peer);
            return false;
        }
        match self.tx.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Peer {} outbound queue full, dropping frame", self.peer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Peer {} writer gone, dropping frame", self.peer);
                false
            }
        }
    }

    /// Encode and queue a frame for this link alone.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(bytes) => self.send(Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode frame for {}: {e}", self.peer);
                false
            }
        }
    }
}

fn state_name(state: LinkState) -> &'static str {
    match state {
        LinkState::Connecting => "connecting",
        LinkState::Open => "open",
        LinkState::Active => "active",
        LinkState::Closed => "closed",
        LinkState::Errored => "errored",
    }
}

/// Drain a link's outbound queue into the WebSocket sink. Ends when the
/// queue closes or the socket rejects a write.
pub(crate) fn spawn_writer<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Arc<Vec<u8>>>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if sink
                .send(Message::Binary(data.to_vec().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    })
}
