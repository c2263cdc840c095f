//! Role-independent session plumbing shared by hub and spoke.
//!
//! Owns everything both roles need regardless of topology position:
//! identity allocation, configuration, the application-visible error
//! list, the event batcher's flush timer, media stream association, and
//! the command loop that drives a role state machine to completion one
//! event at a time.
//!
//! The role itself is a [`TopologyRole`] — two variants, hub and spoke,
//! selected by [`Session::new`] at startup from whether a hub address was
//! supplied.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::batch::{EventBatcher, FLUSH_TICK};
use crate::hub::Hub;
use crate::link::LinkSender;
use crate::media::{CallCapability, MediaError, MediaStream, StreamDirectory};
use crate::presence::{PresenceRegistry, User};
use crate::protocol::{Event, Frame, ProtocolError};
use crate::scene::{ObjectPose, SceneState};
use crate::spoke::Spoke;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Address the hub listens on.
    pub bind_addr: String,
    /// Hub address to dial. `None` makes this participant the hub.
    pub hub_url: Option<String>,
    /// Local display name, sent as connect-time metadata.
    pub name: String,
    /// Outbound queue depth per link before frames to a lagging peer are
    /// dropped.
    pub link_capacity: usize,
    /// Delay between spoke reconnection attempts.
    pub reconnect_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9301".to_string(),
            hub_url: None,
            name: "Anonymous".to_string(),
            link_capacity: 256,
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl SyncConfig {
    /// Hub-side configuration listening on `bind_addr`.
    pub fn hub(bind_addr: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Spoke-side configuration dialing `hub_url`.
    pub fn spoke(hub_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            hub_url: Some(hub_url.into()),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Session-level failures, accumulated in the [`ErrorLog`].
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Identity acquisition or listener failure at the signaling layer.
    Signaling(String),
    /// An overlay connection failed.
    Connection(String),
    /// A media call failed; the affected user stays without a stream.
    Media(MediaError),
    /// A frame could not be encoded or decoded.
    Protocol(ProtocolError),
    /// The session's command loop is gone.
    SessionClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signaling(e) => write!(f, "Signaling error: {e}"),
            Self::Connection(e) => write!(f, "Connection error: {e}"),
            Self::Media(e) => write!(f, "Media error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::SessionClosed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<MediaError> for SyncError {
    fn from(e: MediaError) -> Self {
        SyncError::Media(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

/// Application-visible accumulating error list. Failures are reported
/// here and handled locally; nothing unwinds across components.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    inner: Arc<Mutex<Vec<SyncError>>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, error: SyncError) {
        self.inner.lock().expect("error log poisoned").push(error);
    }

    pub fn snapshot(&self) -> Vec<SyncError> {
        self.inner.lock().expect("error log poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("error log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events emitted to the application (rendering, participant panels).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The upstream link is active (spoke) or the listener is up (hub).
    Connected,
    /// The upstream link dropped; a reconnect is scheduled.
    Disconnected,
    /// A participant entered the session.
    PeerJoined(User),
    /// A participant left the session.
    PeerLeft(Uuid),
    /// An applied batch, in delivery order, for the rendering collaborator.
    Events(Vec<Event>),
    /// A media stream became associated with a participant.
    StreamAttached(MediaStream),
}

/// The polymorphic topology role: hub or spoke.
///
/// Each method runs to completion before the next is dispatched; the
/// owning actor serializes all access, so implementations hold plain
/// mutable state without locks.
pub trait TopologyRole: Send {
    /// A handshake-complete connection joined: register it and onboard
    /// the remote peer.
    fn on_join(&mut self, peer: Uuid, name: String, tx: LinkSender);

    /// A frame arrived on the link to `peer`.
    fn on_data(&mut self, peer: Uuid, frame: Frame);

    /// The link to `peer` closed or failed.
    fn on_leave(&mut self, peer: Uuid);

    /// Deliver a batch: apply it to local state and forward it on every
    /// owned link except `exclude`.
    fn send(&mut self, events: Vec<Event>, exclude: Option<Uuid>);

    /// Current participants, insertion-ordered.
    fn users(&self) -> Vec<User>;

    /// Current replicated object poses.
    fn objects(&self) -> Vec<(u32, ObjectPose)>;
}

/// Apply a batch to the local collaborators: scene poses and the presence
/// registry. Membership changes about `local` itself are ignored — a
/// remote peer can never evict or rename the local entry.
pub(crate) fn apply_events(
    local: Uuid,
    presence: &mut PresenceRegistry,
    scene: &mut SceneState,
    events: &[Event],
    notify: &mpsc::Sender<SessionEvent>,
) {
    for event in events {
        match event {
            Event::User { peer, name } if *peer != local => {
                if presence.upsert(*peer, name.clone(), false) {
                    emit(
                        notify,
                        SessionEvent::PeerJoined(User::new(*peer, name.clone(), false)),
                    );
                }
            }
            Event::Gone { peer } if *peer != local => {
                if presence.remove(*peer).is_some() {
                    emit(notify, SessionEvent::PeerLeft(*peer));
                }
            }
            _ => {}
        }
    }
    scene.apply(events);
    if !events.is_empty() {
        emit(notify, SessionEvent::Events(events.to_vec()));
    }
}

/// Best-effort notification; the application not draining its events must
/// never stall the protocol.
pub(crate) fn emit(notify: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = notify.try_send(event) {
        log::debug!("Dropping session event: {e}");
    }
}

/// Commands driving a role actor.
pub(crate) enum Cmd {
    Join {
        peer: Uuid,
        name: String,
        tx: LinkSender,
    },
    Data {
        peer: Uuid,
        frame: Frame,
    },
    Leave {
        peer: Uuid,
    },
    Record(Event),
    AttachStream(MediaStream),
    DetachStream(Uuid),
    Users(oneshot::Sender<Vec<User>>),
    Objects(oneshot::Sender<Vec<(u32, ObjectPose)>>),
    Streams(oneshot::Sender<Vec<MediaStream>>),
}

/// Cloneable application-facing handle onto a running session.
#[derive(Clone)]
pub struct SyncHandle {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl SyncHandle {
    pub(crate) fn new(cmd_tx: mpsc::Sender<Cmd>) -> Self {
        Self { cmd_tx }
    }

    async fn command(&self, cmd: Cmd) -> Result<(), SyncError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    /// Record a move intent. Batched with every other intent from the
    /// same tick and flushed as one message.
    pub async fn move_object(
        &self,
        object: u32,
        x: f32,
        y: f32,
        state: u8,
        owner: Option<Uuid>,
    ) -> Result<(), SyncError> {
        self.command(Cmd::Record(Event::Move {
            object,
            x,
            y,
            state,
            owner,
        }))
        .await
    }

    /// Hand a remote stream produced by an accepted inbound call to the
    /// session, associating it with the calling peer's user.
    pub async fn accept_call(&self, stream: MediaStream) -> Result<(), SyncError> {
        self.command(Cmd::AttachStream(stream)).await
    }

    /// A call ended; drop the stream associated with `peer`. The user
    /// stays in presence without media.
    pub async fn end_call(&self, peer: Uuid) -> Result<(), SyncError> {
        self.command(Cmd::DetachStream(peer)).await
    }

    /// Current participants, insertion-ordered.
    pub async fn users(&self) -> Result<Vec<User>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Cmd::Users(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Current replicated object poses.
    pub async fn objects(&self) -> Result<Vec<(u32, ObjectPose)>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Cmd::Objects(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Streams currently associated with participants.
    pub async fn streams(&self) -> Result<Vec<MediaStream>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(Cmd::Streams(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }
}

/// Drives a role state machine: dispatches commands one at a time and
/// owns the batcher's flush timer, so a recorded event is sent on the
/// tick after its recording — never reordered, never duplicated.
pub(crate) struct RoleActor<R: TopologyRole> {
    role: R,
    batcher: EventBatcher,
    directory: StreamDirectory,
    cmd_rx: mpsc::Receiver<Cmd>,
    notify: mpsc::Sender<SessionEvent>,
}

impl<R: TopologyRole> RoleActor<R> {
    pub fn new(
        role: R,
        cmd_rx: mpsc::Receiver<Cmd>,
        notify: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            role,
            batcher: EventBatcher::new(),
            directory: StreamDirectory::new(),
            cmd_rx,
            notify,
        }
    }

    pub async fn run(mut self) {
        let flush_timer = sleep(Duration::ZERO);
        tokio::pin!(flush_timer);
        let mut flush_armed = false;

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    let cmd = match maybe_cmd {
                        Some(cmd) => cmd,
                        None => break,
                    };
                    match cmd {
                        Cmd::Join { peer, name, tx } => self.role.on_join(peer, name, tx),
                        Cmd::Data { peer, frame } => self.role.on_data(peer, frame),
                        Cmd::Leave { peer } => self.role.on_leave(peer),
                        Cmd::Record(event) => {
                            if self.batcher.record(event) {
                                flush_timer.as_mut().reset(Instant::now() + FLUSH_TICK);
                                flush_armed = true;
                            }
                        }
                        Cmd::AttachStream(stream) => {
                            log::info!("Stream attached for peer {}", stream.peer);
                            self.directory.attach(stream.clone());
                            emit(&self.notify, SessionEvent::StreamAttached(stream));
                        }
                        Cmd::DetachStream(peer) => {
                            if self.directory.detach(peer).is_some() {
                                log::info!("Stream detached for peer {peer}");
                            }
                        }
                        Cmd::Users(reply) => {
                            let _ = reply.send(self.role.users());
                        }
                        Cmd::Objects(reply) => {
                            let _ = reply.send(self.role.objects());
                        }
                        Cmd::Streams(reply) => {
                            let _ = reply.send(self.directory.all());
                        }
                    }
                }

                _ = &mut flush_timer, if flush_armed => {
                    flush_armed = false;
                    let events = self.batcher.flush();
                    if !events.is_empty() {
                        self.role.send(events, None);
                    }
                }
            }
        }
    }
}

/// Calls every peer the role asks for, feeding resulting streams back to
/// the actor. Failures land in the error list; the user stays without
/// media.
pub(crate) fn spawn_call_pump(
    capability: Arc<dyn CallCapability>,
    mut calls_rx: mpsc::UnboundedReceiver<Uuid>,
    cmd_tx: mpsc::Sender<Cmd>,
    errors: ErrorLog,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(peer) = calls_rx.recv().await {
            match capability.call(peer).await {
                Ok(stream) => {
                    if cmd_tx.send(Cmd::AttachStream(stream)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Call to {peer} failed: {e}");
                    errors.push(SyncError::Media(e));
                }
            }
        }
    })
}

/// A configured session, hub or spoke.
pub enum Session {
    Hub(Hub),
    Spoke(Spoke),
}

impl Session {
    /// Select the role from the configuration: a supplied hub address
    /// makes this participant a spoke, otherwise it becomes the hub.
    pub fn new(config: SyncConfig, media: Arc<dyn CallCapability>) -> Self {
        if config.hub_url.is_some() {
            Session::Spoke(Spoke::new(config, media))
        } else {
            Session::Hub(Hub::new(config))
        }
    }

    pub fn handle(&self) -> SyncHandle {
        match self {
            Session::Hub(hub) => hub.handle(),
            Session::Spoke(spoke) => spoke.handle(),
        }
    }

    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        match self {
            Session::Hub(hub) => hub.take_event_rx(),
            Session::Spoke(spoke) => spoke.take_event_rx(),
        }
    }

    pub fn local_peer(&self) -> Uuid {
        match self {
            Session::Hub(hub) => hub.local_peer(),
            Session::Spoke(spoke) => spoke.local_peer(),
        }
    }

    pub fn errors(&self) -> ErrorLog {
        match self {
            Session::Hub(hub) => hub.errors(),
            Session::Spoke(spoke) => spoke.errors(),
        }
    }

    /// Run the session until its command loop ends.
    pub async fn run(self) -> Result<(), SyncError> {
        match self {
            Session::Hub(hub) => hub.run().await,
            Session::Spoke(spoke) => spoke.run().await,
        }
    }
}
