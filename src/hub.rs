//! Hub role: accepts every spoke connection and rebroadcasts mutations.
//!
//! ```text
//! Spoke A ──┐
//! Spoke B ──┼── HubCore ── links registry ── flood (exclude sender)
//! Spoke C ──┘      │
//!                  ├── PresenceRegistry (membership authority)
//!                  └── SceneState (onboarding snapshots)
//! ```
//!
//! Onboarding a newcomer is strictly snapshot-before-announce: the hub
//! sends its own identity, the membership snapshot and the scene batch to
//! the new link alone, and only then announces the newcomer to everyone
//! else — so a spoke never sees its own join.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::link::{spawn_writer, Link, LinkEvent, LinkSender};
use crate::presence::{PresenceRegistry, User};
use crate::protocol::{Event, Frame, PeerSummary};
use crate::scene::{ObjectPose, SceneState};
use crate::topology::{
    apply_events, emit, Cmd, ErrorLog, RoleActor, SessionEvent, SyncConfig, SyncError, SyncHandle,
    TopologyRole,
};

/// Hub-side topology state machine. Driven by the role actor; every
/// handler runs to completion before the next event is dispatched.
pub struct HubCore {
    local: User,
    /// One link per spoke, keyed by peer id. Never contains the hub
    /// itself.
    links: HashMap<Uuid, Link>,
    presence: PresenceRegistry,
    scene: SceneState,
    notify: mpsc::Sender<SessionEvent>,
    errors: ErrorLog,
}

impl HubCore {
    pub fn new(local: User, notify: mpsc::Sender<SessionEvent>, errors: ErrorLog) -> Self {
        let mut presence = PresenceRegistry::new();
        presence.upsert(local.id, local.name.clone(), true);
        Self {
            local,
            links: HashMap::new(),
            presence,
            scene: SceneState::new(),
            notify,
            errors,
        }
    }

    /// Encode once, queue on every active link except `exclude`.
    /// Individual link failures never abort delivery to the rest.
    fn broadcast(&self, frame: &Frame, exclude: Option<Uuid>) {
        let bytes = match frame.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode broadcast frame: {e}");
                self.errors.push(SyncError::Protocol(e));
                return;
            }
        };
        for link in self.links.values() {
            if Some(link.peer()) == exclude {
                continue;
            }
            link.send(bytes.clone());
        }
    }

    /// Membership snapshot for a newcomer: every other active link plus
    /// the hub's own user. Never includes the newcomer.
    fn others_snapshot(&self) -> Vec<PeerSummary> {
        let mut others: Vec<PeerSummary> = self
            .links
            .values()
            .filter(|link| link.is_active())
            .map(Link::summary)
            .collect();
        others.push(self.local.summary());
        others
    }
}

impl TopologyRole for HubCore {
    fn on_join(&mut self, peer: Uuid, name: String, tx: LinkSender) {
        if peer == self.local.id {
            log::warn!("Rejecting connection claiming the hub's own id");
            return;
        }

        // Rapid reconnect: a stale entry under the same id is replaced
        // before the new link is registered.
        if self.links.remove(&peer).is_some() {
            log::debug!("Replacing stale link for {peer}");
        }

        let mut link = Link::new(peer, name.clone(), tx);
        link.transition(LinkEvent::HandshakeReceived);

        // Snapshot to the newcomer alone: hub identity, membership, scene.
        link.send_frame(&Frame::Hello {
            peer: self.local.id,
            name: self.local.name.clone(),
        });
        link.send_frame(&Frame::Others(self.others_snapshot()));
        link.send_frame(&Frame::Batch(self.scene.snapshot_events()));

        self.links.insert(peer, link);
        log::info!("Peer {name} ({peer}) joined");

        // Announce the newcomer to everyone else; applies locally too.
        self.send(vec![Event::User { peer, name }], Some(peer));
    }

    fn on_data(&mut self, peer: Uuid, frame: Frame) {
        match frame {
            Frame::Batch(events) => {
                log::debug!("Batch of {} from {peer}", events.len());
                self.send(events, Some(peer));
            }
            // Spokes never originate control frames.
            other => {
                log::warn!("Ignoring unexpected control frame from {peer}: {other:?}");
            }
        }
    }

    fn on_leave(&mut self, peer: Uuid) {
        let Some(link) = self.links.get(&peer) else {
            return;
        };
        // A close notification from a connection that has already been
        // replaced must not evict its successor.
        if !link.is_closed() {
            log::debug!("Ignoring stale close for replaced link {peer}");
            return;
        }

        self.links.remove(&peer);
        if self.presence.remove(peer).is_some() {
            emit(&self.notify, SessionEvent::PeerLeft(peer));
        }
        log::info!("Peer {peer} left");

        self.broadcast(&Frame::announce_gone(peer), None);
    }

    fn send(&mut self, events: Vec<Event>, exclude: Option<Uuid>) {
        if events.is_empty() {
            return;
        }
        apply_events(
            self.local.id,
            &mut self.presence,
            &mut self.scene,
            &events,
            &self.notify,
        );
        self.broadcast(&Frame::Batch(events), exclude);
    }

    fn users(&self) -> Vec<User> {
        self.presence.all().to_vec()
    }

    fn objects(&self) -> Vec<(u32, ObjectPose)> {
        self.scene.objects().map(|(id, pose)| (*id, *pose)).collect()
    }
}

/// The hub session: identity, listener, and the actor driving [`HubCore`].
pub struct Hub {
    config: SyncConfig,
    local: User,
    cmd_tx: mpsc::Sender<Cmd>,
    cmd_rx: Option<mpsc::Receiver<Cmd>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    errors: ErrorLog,
}

impl Hub {
    /// Create a hub session. The local peer identity is allocated here,
    /// standing in for the signaling layer's identity grant.
    pub fn new(config: SyncConfig) -> Self {
        let local = User::new(Uuid::new_v4(), config.name.clone(), true);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            config,
            local,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            event_tx,
            event_rx: Some(event_rx),
            errors: ErrorLog::new(),
        }
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle::new(self.cmd_tx.clone())
    }

    /// Take the session event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn local_peer(&self) -> Uuid {
        self.local.id
    }

    pub fn errors(&self) -> ErrorLog {
        self.errors.clone()
    }

    /// Bind the listener and accept spokes until the process ends.
    ///
    /// A failed bind is retried exactly once; accept errors are reported
    /// and skipped.
    pub async fn run(mut self) -> Result<(), SyncError> {
        let cmd_rx = self.cmd_rx.take().ok_or(SyncError::SessionClosed)?;
        let core = HubCore::new(self.local.clone(), self.event_tx.clone(), self.errors.clone());
        tokio::spawn(RoleActor::new(core, cmd_rx, self.event_tx.clone()).run());

        let listener = match TcpListener::bind(&self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(first) => {
                log::warn!("Bind to {} failed ({first}), retrying once", self.config.bind_addr);
                self.errors.push(SyncError::Signaling(first.to_string()));
                TcpListener::bind(&self.config.bind_addr).await.map_err(|e| {
                    let err = SyncError::Signaling(e.to_string());
                    self.errors.push(err.clone());
                    err
                })?
            }
        };
        log::info!(
            "Hub {} listening on {}",
            self.local.id,
            self.config.bind_addr
        );
        emit(&self.event_tx, SessionEvent::Connected);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    self.errors.push(SyncError::Signaling(e.to_string()));
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let cmd_tx = self.cmd_tx.clone();
            let capacity = self.config.link_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, cmd_tx, capacity).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// One accepted spoke connection: handshake, then pump frames into the
/// role actor until the socket ends.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    cmd_tx: mpsc::Sender<Cmd>,
    capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let (link_tx, link_rx) = mpsc::channel(capacity);
    let writer = spawn_writer(ws_sender, link_rx);

    let mut peer: Option<Uuid> = None;

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                let bytes: Vec<u8> = data.into();
                match Frame::decode(&bytes) {
                    Ok(Frame::Hello { peer: remote, name }) if peer.is_none() => {
                        peer = Some(remote);
                        let join = Cmd::Join {
                            peer: remote,
                            name,
                            tx: link_tx.clone(),
                        };
                        if cmd_tx.send(join).await.is_err() {
                            break;
                        }
                    }
                    Ok(frame) => match peer {
                        Some(remote) => {
                            if cmd_tx
                                .send(Cmd::Data {
                                    peer: remote,
                                    frame,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        None => {
                            log::warn!("Frame from {addr} before handshake, dropping");
                        }
                    },
                    Err(e) => {
                        log::warn!("Failed to decode message from {addr}: {e}");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::error!("WebSocket error from {addr}: {e}");
                break;
            }
        }
    }

    // Kill the writer before reporting the departure so the role's
    // stale-close guard sees a dead link.
    writer.abort();
    if let Some(peer) = peer {
        log::info!("Connection closed from {addr}");
        let _ = cmd_tx.send(Cmd::Leave { peer }).await;
    }
    Ok(())
}
