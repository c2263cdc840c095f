//! Spoke role: one upstream link to the hub, applied state, media calls
//! toward the peers the hub lists.
//!
//! A spoke owns exactly one upstream connection. Mutations arriving on it
//! are applied locally and, when the spoke itself fans out to sub-peers
//! (sub-relay use), flooded onward excluding the upstream link. Losing
//! the hub link schedules a reconnect after a fixed delay, indefinitely —
//! the session is pointless without it.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::link::{spawn_writer, Link, LinkEvent, LinkSender};
use crate::media::CallCapability;
use crate::presence::{PresenceRegistry, User};
use crate::protocol::{Event, Frame};
use crate::scene::{ObjectPose, SceneState};
use crate::topology::{
    apply_events, emit, spawn_call_pump, Cmd, ErrorLog, RoleActor, SessionEvent, SyncConfig,
    SyncError, SyncHandle, TopologyRole,
};

/// Spoke-side topology state machine.
pub struct SpokeCore {
    local: User,
    /// The sole upstream link, present while the hub connection is up.
    upstream: Option<Link>,
    /// Sub-relay links, for spokes that fan out to peers of their own.
    fanout: Vec<Link>,
    presence: PresenceRegistry,
    scene: SceneState,
    notify: mpsc::Sender<SessionEvent>,
    errors: ErrorLog,
    /// Peers to dial for media, drained by the call pump.
    calls: mpsc::UnboundedSender<Uuid>,
}

impl SpokeCore {
    pub fn new(
        local: User,
        notify: mpsc::Sender<SessionEvent>,
        errors: ErrorLog,
        calls: mpsc::UnboundedSender<Uuid>,
    ) -> Self {
        let mut presence = PresenceRegistry::new();
        presence.upsert(local.id, local.name.clone(), true);
        Self {
            local,
            upstream: None,
            fanout: Vec::new(),
            presence,
            scene: SceneState::new(),
            notify,
            errors,
            calls,
        }
    }

    /// Register a sub-peer link this spoke relays to.
    pub fn adopt_fanout(&mut self, peer: Uuid, name: impl Into<String>, tx: LinkSender) {
        let mut link = Link::new(peer, name, tx);
        link.transition(LinkEvent::HandshakeReceived);
        self.fanout.push(link);
    }

    /// Forward pre-encoded bytes on every owned link except `exclude`.
    fn forward(&self, frame: &Frame, exclude: Option<Uuid>) {
        let bytes = match frame.encode() {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                log::error!("Failed to encode outbound frame: {e}");
                self.errors.push(SyncError::Protocol(e));
                return;
            }
        };
        if let Some(upstream) = &self.upstream {
            if Some(upstream.peer()) != exclude {
                upstream.send(bytes.clone());
            }
        }
        for link in &self.fanout {
            if Some(link.peer()) == exclude {
                continue;
            }
            link.send(bytes.clone());
        }
    }

    /// Handle the hub's membership snapshot: register every pre-existing
    /// participant and dial each one for media. A failed call leaves the
    /// user in presence without a stream.
    fn on_others(&mut self, list: Vec<crate::protocol::PeerSummary>) {
        log::info!("Membership snapshot: {} peers", list.len());
        for summary in list {
            if summary.peer == self.local.id {
                continue;
            }
            if self.presence.upsert(summary.peer, summary.name.clone(), false) {
                emit(
                    &self.notify,
                    SessionEvent::PeerJoined(User::new(summary.peer, summary.name, false)),
                );
            }
            if self.calls.send(summary.peer).is_err() {
                log::debug!("Call pump gone, skipping media call to {}", summary.peer);
            }
        }
    }
}

impl TopologyRole for SpokeCore {
    fn on_join(&mut self, peer: Uuid, name: String, tx: LinkSender) {
        // Membership is re-derived from the new link's snapshot; forget
        // everyone learned over the previous one.
        let stale: Vec<Uuid> = self
            .presence
            .all()
            .iter()
            .filter(|u| !u.is_local)
            .map(|u| u.id)
            .collect();
        for gone in stale {
            self.presence.remove(gone);
            emit(&self.notify, SessionEvent::PeerLeft(gone));
        }

        let mut link = Link::new(peer, name, tx);
        link.transition(LinkEvent::HandshakeReceived);
        self.upstream = Some(link);
        log::info!("Hub link to {peer} active");
        emit(&self.notify, SessionEvent::Connected);
    }

    fn on_data(&mut self, peer: Uuid, frame: Frame) {
        match frame {
            Frame::Batch(events) => {
                // Apply locally; relay onward excluding the arrival link.
                self.send(events, Some(peer));
            }
            Frame::Others(list) => {
                self.on_others(list);
            }
            Frame::Hello { .. } => {
                log::debug!("Duplicate handshake from {peer}, ignoring");
            }
        }
    }

    fn on_leave(&mut self, peer: Uuid) {
        if self.upstream.as_ref().is_some_and(|l| l.peer() == peer) {
            self.upstream = None;
            log::info!("Hub link lost");
            emit(&self.notify, SessionEvent::Disconnected);
            return;
        }
        self.fanout.retain(|link| link.peer() != peer);
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
        self.forward(&Frame::Batch(events), exclude);
    }

    fn users(&self) -> Vec<User> {
        self.presence.all().to_vec()
    }

    fn objects(&self) -> Vec<(u32, ObjectPose)> {
        self.scene.objects().map(|(id, pose)| (*id, *pose)).collect()
    }
}

/// The spoke session: identity, the reconnecting hub link, and the actor
/// driving [`SpokeCore`].
pub struct Spoke {
    config: SyncConfig,
    local: User,
    cmd_tx: mpsc::Sender<Cmd>,
    cmd_rx: Option<mpsc::Receiver<Cmd>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    errors: ErrorLog,
    media: Arc<dyn CallCapability>,
}

impl Spoke {
    /// Create a spoke session. The local peer identity is allocated here,
    /// standing in for the signaling layer's identity grant.
    pub fn new(config: SyncConfig, media: Arc<dyn CallCapability>) -> Self {
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
            media,
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

    /// Dial the hub and keep the link alive until the process ends.
    ///
    /// Every connection loss — dial failure, socket error, clean close —
    /// lands back in the same loop, which sleeps the configured delay and
    /// tries again. The loop is the single owner of retry scheduling, so
    /// a successful reconnect can never race a stale retry timer.
    pub async fn run(mut self) -> Result<(), SyncError> {
        let hub_url = self
            .config
            .hub_url
            .clone()
            .ok_or_else(|| SyncError::Signaling("no hub address configured".into()))?;

        let cmd_rx = self.cmd_rx.take().ok_or(SyncError::SessionClosed)?;
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let core = SpokeCore::new(
            self.local.clone(),
            self.event_tx.clone(),
            self.errors.clone(),
            calls_tx,
        );
        tokio::spawn(RoleActor::new(core, cmd_rx, self.event_tx.clone()).run());
        spawn_call_pump(
            self.media.clone(),
            calls_rx,
            self.cmd_tx.clone(),
            self.errors.clone(),
        );

        loop {
            match self.connect_once(&hub_url).await {
                Ok(()) => {
                    log::info!(
                        "Hub link ended, reconnecting in {:?}",
                        self.config.reconnect_delay
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Hub connect failed: {e}, retrying in {:?}",
                        self.config.reconnect_delay
                    );
                    self.errors.push(e);
                }
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// One connection attempt: dial, hand over our metadata, pump frames
    /// into the role actor until the socket ends.
    async fn connect_once(&self, hub_url: &str) -> Result<(), SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(hub_url)
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        log::debug!("Connected to hub at {hub_url}");

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let (link_tx, link_rx) = mpsc::channel(self.config.link_capacity);
        let writer = spawn_writer(ws_sender, link_rx);

        // Our identity and display name are the first frame on the wire.
        let hello = Frame::Hello {
            peer: self.local.id,
            name: self.local.name.clone(),
        };
        let bytes = hello.encode().map_err(SyncError::Protocol)?;
        if link_tx.send(Arc::new(bytes)).await.is_err() {
            return Err(SyncError::Connection("writer task gone".into()));
        }

        let mut hub_peer: Option<Uuid> = None;

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match Frame::decode(&bytes) {
                        Ok(Frame::Hello { peer, name }) if hub_peer.is_none() => {
                            hub_peer = Some(peer);
                            let join = Cmd::Join {
                                peer,
                                name,
                                tx: link_tx.clone(),
                            };
                            if self.cmd_tx.send(join).await.is_err() {
                                break;
                            }
                        }
                        Ok(frame) => match hub_peer {
                            Some(peer) => {
                                if self.cmd_tx.send(Cmd::Data { peer, frame }).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                log::warn!("Frame before hub handshake, dropping");
                            }
                        },
                        Err(e) => {
                            log::warn!("Failed to decode message from hub: {e}");
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error on hub link: {e}");
                    break;
                }
            }
        }

        // Kill the writer before reporting the loss so the link reads as
        // dead by the time the role clears it.
        writer.abort();
        if let Some(peer) = hub_peer {
            let _ = self.cmd_tx.send(Cmd::Leave { peer }).await;
        }
        Ok(())
    }
}
