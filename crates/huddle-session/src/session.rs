//! Collaboration session - one room, one user
//!
//! A [`CollabSession`] owns the room channel, the local document replica,
//! the presence roster and the call mesh. Incoming messages are dispatched
//! to each part from the transport's reader task; mesh negotiation runs on
//! its own sequential pump.

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use huddle_core::{
    new_replica_id, CursorPosition, Document, MediaState, Participant, PresenceTracker, RoomId,
};
use huddle_mesh::{
    MediaConstraints, MediaDevices, MediaStream, MeshError, MeshEvent, MeshNotice, PeerConnector,
    PeerId, PeerLinkState, PeerMesh, SignalSink,
};
use huddle_protocol::{Message, MessageKind};
use huddle_transport::{Connection, Credential, SubscriptionId, TransportClient, TransportError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// What the UI is told about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Remote edits changed the text
    TextChanged(String),
    RosterChanged(Vec<Participant>),
    ConnectionChanged(Connection),
    PeerStateChanged { peer_id: PeerId, state: PeerLinkState },
}

struct Shared {
    room: RoomId,
    credential: Credential,
    document: Document,
    presence: Mutex<PresenceTracker>,
    transport: Arc<TransportClient>,
    mesh: Arc<PeerMesh>,
    mesh_events: mpsc::UnboundedSender<MeshEvent>,
    events: broadcast::Sender<SessionEvent>,
    in_call: AtomicBool,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: &Message) -> Result<()> {
        self.transport.send(message)?;
        Ok(())
    }

    fn apply_remote(&self, data: &[u8]) {
        match self.document.apply_remote_update(data) {
            Ok(0) => {}
            Ok(integrated) => {
                debug!(room = %self.room, integrated, "Merged remote update");
                self.emit(SessionEvent::TextChanged(self.document.text()));
            }
            Err(e) => warn!(room = %self.room, error = %e, "Dropping bad update"),
        }
    }

    fn on_presence(&self, message: &Message) {
        let now = Instant::now();
        let roster = {
            let mut presence = self.presence.lock();
            let changed = match message {
                Message::UserJoined { user_id, user_name } => {
                    presence.on_join(user_id, user_name, now)
                }
                Message::UserLeft { user_id } => presence.on_leave(user_id, now),
                Message::Cursor {
                    user_id,
                    position,
                    color,
                    user_name,
                } => presence.on_cursor(
                    user_id,
                    *position,
                    Some(color.as_str()).filter(|c| !c.is_empty()),
                    Some(user_name.as_str()).filter(|n| !n.is_empty()),
                    now,
                ),
                Message::Awareness {
                    users,
                    cursor,
                    user_id,
                } => match (user_id, users) {
                    // Full roster from the relay
                    (None, Some(users)) => {
                        presence.on_presence(users.clone(), now);
                        true
                    }
                    (Some(id), Some(users)) => users
                        .iter()
                        .filter(|p| p.id == *id)
                        .fold(false, |changed, p| presence.upsert(p.clone(), now) || changed),
                    (Some(id), None) => match cursor {
                        Some(cursor) => presence.on_cursor(id, *cursor, None, None, now),
                        None => {
                            presence.touch(id, now);
                            false
                        }
                    },
                    (None, None) => false,
                },
                _ => false,
            };
            changed.then(|| presence.participants())
        };

        if let Some(roster) = roster {
            self.emit(SessionEvent::RosterChanged(roster));
        }
    }

    fn on_mesh_message(&self, message: &Message) {
        if let Some(event) = self.mesh.route(message) {
            let _ = self.mesh_events.send(event);
        }
    }

    /// Broadcast our own presence entry
    fn announce(&self) {
        let local = self.presence.lock().local().clone();
        let awareness = Message::Awareness {
            users: Some(vec![local]),
            cursor: None,
            user_id: None,
        };
        if let Err(e) = self.send(&awareness) {
            debug!(room = %self.room, error = %e, "Awareness not sent");
        }
    }

    fn refresh_media_state(&self) {
        let state = MediaState {
            muted: !self.mesh.microphone_enabled(),
            video_off: !self.mesh.camera_enabled(),
        };
        self.presence.lock().set_local_media(state);
        self.announce();
    }

    /// The channel dropped. The relay reports us gone to the other peers,
    /// so our links are dead; they are rebuilt when the channel reopens.
    fn on_lost(&self) {
        if self.in_call.load(Ordering::SeqCst) {
            self.mesh.reset_links();
        }
    }

    /// Every transition to open: fetch the room state, push what we wrote
    /// while away, and re-announce ourselves
    fn on_open(&self) {
        info!(room = %self.room, "Channel open, resyncing");

        if let Err(e) = self.send(&Message::SyncRequest) {
            warn!(room = %self.room, error = %e, "Sync request not sent");
            return;
        }

        let authored = self.document.authored_update();
        if !authored.is_empty() {
            let sent = Message::update(&authored)
                .map_err(SessionError::from)
                .and_then(|message| self.send(&message));
            match sent {
                Ok(()) => debug!(room = %self.room, ops = authored.len(), "Re-sent local operations"),
                Err(e) => warn!(room = %self.room, error = %e, "Local operations not re-sent"),
            }
        }

        self.announce();

        if self.in_call.load(Ordering::SeqCst) {
            if let Err(e) = self.mesh.initialize(&self.credential.user_id) {
                warn!(room = %self.room, error = %e, "Could not rejoin call");
            }
        }
    }
}

/// An open collaboration room
pub struct CollabSession {
    shared: Arc<Shared>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CollabSession {
    /// Open `room` as `credential`. Must be called within a Tokio runtime;
    /// the connection is established in the background.
    pub fn open(
        config: SessionConfig,
        room: RoomId,
        credential: Credential,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        let transport = Arc::new(TransportClient::new(config.transport_config()));
        let sink: Arc<dyn SignalSink> = transport.clone();
        let mesh = Arc::new(PeerMesh::new(
            config.mesh_config(),
            devices,
            connector,
            sink,
            credential.user_name.clone(),
        ));
        let (mesh_events, mesh_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let local = Participant::new(credential.user_id.clone(), credential.user_name.clone());

        let shared = Arc::new(Shared {
            room: room.clone(),
            credential: credential.clone(),
            document: Document::new(room.clone(), new_replica_id()),
            presence: Mutex::new(PresenceTracker::new(local, config.presence_timeout())),
            transport: transport.clone(),
            mesh: mesh.clone(),
            mesh_events,
            events,
            in_call: AtomicBool::new(false),
        });

        let subscriptions = subscribe(&shared);
        let tasks = vec![
            tokio::spawn(mesh.clone().pump(mesh_rx)),
            tokio::spawn(watch_connection(
                shared.clone(),
                transport.watch(),
                transport.connection().opened,
            )),
            tokio::spawn(keep_presence(shared.clone(), config.heartbeat_interval())),
            tokio::spawn(forward_notices(shared.clone(), mesh.subscribe())),
        ];

        let session = Self {
            shared,
            subscriptions: Mutex::new(subscriptions),
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        };

        transport.connect(&room, credential.clone())?;
        info!(room = %room, user = %credential.user_id, "Session opened");
        Ok(session)
    }

    pub fn room(&self) -> &RoomId {
        &self.shared.room
    }

    pub fn document(&self) -> &Document {
        &self.shared.document
    }

    pub fn text(&self) -> String {
        self.shared.document.text()
    }

    /// Replace the local text and broadcast the difference.
    ///
    /// Returns `false` if nothing changed. Edits made while disconnected are
    /// kept and sent when the channel reopens.
    pub fn apply_local_change(&self, new_text: &str) -> Result<bool> {
        self.ensure_open()?;
        let Some(update) = self.shared.document.apply_local_change(new_text)? else {
            return Ok(false);
        };

        match self.shared.send(&Message::update(&update)?) {
            Ok(()) => {}
            Err(SessionError::Transport(TransportError::Unavailable)) => {
                debug!(room = %self.shared.room, "Offline edit kept for resync");
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }

    /// Ask the relay for the full document state
    pub fn request_sync(&self) -> Result<()> {
        self.ensure_open()?;
        self.shared.send(&Message::SyncRequest)
    }

    /// Share the local cursor. Returns `false` if it did not move.
    pub fn broadcast_cursor(&self, position: CursorPosition) -> Result<bool> {
        self.ensure_open()?;
        let local = {
            let mut presence = self.shared.presence.lock();
            if !presence.set_local_cursor(position) {
                return Ok(false);
            }
            presence.local().clone()
        };

        self.shared.send(&Message::Cursor {
            user_id: local.id,
            position,
            color: local.color,
            user_name: local.display_name,
        })?;
        Ok(true)
    }

    /// Remote participants ordered by id
    pub fn participants(&self) -> Vec<Participant> {
        self.shared.presence.lock().participants()
    }

    pub fn local_participant(&self) -> Participant {
        self.shared.presence.lock().local().clone()
    }

    /// Start local media and join the room's call
    pub async fn join_call(&self, constraints: MediaConstraints) -> Result<PeerId> {
        self.ensure_open()?;
        self.shared.mesh.start_local_media(constraints).await?;
        self.shared.in_call.store(true, Ordering::SeqCst);
        self.shared.refresh_media_state();

        let user_id = &self.shared.credential.user_id;
        match self.shared.mesh.initialize(user_id) {
            Ok(peer) => Ok(peer),
            Err(MeshError::Transport(e)) => {
                debug!(error = %e, "Call announced once the channel opens");
                Ok(PeerId::new(user_id.as_str()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Hang up on everybody and release local media
    pub fn leave_call(&self) {
        if !self.shared.in_call.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.mesh.disconnect();
        self.shared.refresh_media_state();
    }

    /// Returns whether the microphone is now enabled
    pub fn toggle_microphone(&self) -> Result<bool> {
        let enabled = self.shared.mesh.toggle_microphone()?;
        self.shared.refresh_media_state();
        Ok(enabled)
    }

    /// Returns whether the camera is now enabled
    pub fn toggle_camera(&self) -> Result<bool> {
        let enabled = self.shared.mesh.toggle_camera()?;
        self.shared.refresh_media_state();
        Ok(enabled)
    }

    pub async fn share_screen(&self) -> Result<MediaStream> {
        Ok(self.shared.mesh.share_screen().await?)
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        Ok(self.shared.mesh.stop_screen_share().await?)
    }

    pub fn mesh(&self) -> &Arc<PeerMesh> {
        &self.shared.mesh
    }

    pub fn connection(&self) -> Connection {
        self.shared.transport.connection()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Leave the room. Handlers are unsubscribed, the channel and every
    /// peer link are closed and background tasks are stopped before this
    /// returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for id in self.subscriptions.lock().drain(..) {
            self.shared.transport.off(id);
        }
        // Hangups go out before the channel closes
        self.shared.in_call.store(false, Ordering::SeqCst);
        self.shared.mesh.disconnect();
        self.shared.transport.disconnect();

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(room = %self.shared.room, "Session closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn subscribe(shared: &Arc<Shared>) -> Vec<SubscriptionId> {
    let transport = &shared.transport;
    let mut ids = Vec::new();

    for kind in [MessageKind::Sync, MessageKind::Update] {
        let weak = Arc::downgrade(shared);
        ids.push(transport.on(kind, move |message| {
            let Some(shared) = weak.upgrade() else { return };
            if let Message::Sync { data } | Message::Update { data } = message {
                shared.apply_remote(data);
            }
        }));
    }

    for kind in [
        MessageKind::UserJoined,
        MessageKind::UserLeft,
        MessageKind::Cursor,
        MessageKind::Awareness,
    ] {
        let weak = Arc::downgrade(shared);
        ids.push(transport.on(kind, move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_presence(message);
            }
        }));
    }

    for kind in [
        MessageKind::WebrtcExistingPeers,
        MessageKind::WebrtcPeerJoined,
        MessageKind::WebrtcPeerLeft,
        MessageKind::WebrtcSignal,
    ] {
        let weak = Arc::downgrade(shared);
        ids.push(transport.on(kind, move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_mesh_message(message);
            }
        }));
    }

    ids
}

async fn watch_connection(
    shared: Arc<Shared>,
    mut status: watch::Receiver<Connection>,
    mut last_opened: u64,
) {
    let mut was_open = status.borrow().is_open();

    while status.changed().await.is_ok() {
        let connection = *status.borrow_and_update();
        shared.emit(SessionEvent::ConnectionChanged(connection));

        if connection.is_open() && connection.opened != last_opened {
            last_opened = connection.opened;
            was_open = true;
            shared.on_open();
        } else if !connection.is_open() && was_open {
            was_open = false;
            shared.on_lost();
        }
    }
}

/// Renew our awareness and drop silent participants
async fn keep_presence(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shared.transport.connection().is_open() {
            shared.announce();
        }

        let roster = {
            let mut presence = shared.presence.lock();
            let expired = presence.expire(Instant::now());
            (!expired.is_empty()).then(|| {
                info!(room = %shared.room, count = expired.len(), "Expired silent participants");
                presence.participants()
            })
        };
        if let Some(roster) = roster {
            shared.emit(SessionEvent::RosterChanged(roster));
        }
    }
}

async fn forward_notices(shared: Arc<Shared>, mut notices: broadcast::Receiver<MeshNotice>) {
    loop {
        match notices.recv().await {
            Ok(MeshNotice::LinkStateChanged { peer_id, state }) => {
                shared.emit(SessionEvent::PeerStateChanged { peer_id, state });
            }
            Ok(MeshNotice::ScreenShareChanged(sharing)) => {
                debug!(sharing, "Screen share changed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Mesh notices lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
