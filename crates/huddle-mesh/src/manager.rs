//! Peer mesh manager - one direct link per remote participant
//!
//! Glare avoidance: the participant that joins the mesh calls every peer
//! listed in its `webrtc-existing-peers` roster. Peers that learn about the
//! newcomer through `webrtc-peer-joined` only record it and wait for its
//! offer, so exactly one side of every pair originates the call.

use crate::error::{MeshError, Result};
use crate::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack};
use crate::peer::{PeerId, PeerLink, PeerLinkState};
use crate::signaling::{
    ConnectionEvents, IceServer, LinkEvent, LinkEventKind, MeshEvent, PeerConnection,
    PeerConnector, SignalPayload, SignalSink, SignalingGlue,
};
use huddle_protocol::Message;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Mesh configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
        }
    }
}

/// Changes the call UI reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshNotice {
    LinkStateChanged { peer_id: PeerId, state: PeerLinkState },
    ScreenShareChanged(bool),
}

/// Point-in-time view of one link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub peer_id: PeerId,
    pub user_name: Option<String>,
    pub state: PeerLinkState,
    pub initiator: bool,
    pub has_remote_stream: bool,
}

/// Full-mesh call manager for one participant
pub struct PeerMesh {
    config: MeshConfig,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    sink: Arc<dyn SignalSink>,
    user_name: String,
    glue: RwLock<Option<SignalingGlue>>,
    links: Mutex<HashMap<PeerId, PeerLink>>,
    names: Mutex<HashMap<PeerId, String>>,
    local_media: Mutex<Option<MediaStream>>,
    screen: Mutex<Option<MediaStream>>,
    /// Serializes capture requests so a permission prompt is never shown twice
    media_gate: tokio::sync::Mutex<()>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    notices: broadcast::Sender<MeshNotice>,
}

impl PeerMesh {
    pub fn new(
        config: MeshConfig,
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn SignalSink>,
        user_name: impl Into<String>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(256);

        Self {
            config,
            devices,
            connector,
            sink,
            user_name: user_name.into(),
            glue: RwLock::new(None),
            links: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            local_media: Mutex::new(None),
            screen: Mutex::new(None),
            media_gate: tokio::sync::Mutex::new(()),
            link_tx,
            link_rx: Mutex::new(Some(link_rx)),
            notices,
        }
    }

    /// Announce ourselves in the room's mesh and return our peer address.
    ///
    /// Calling it again (after a reconnect) re-announces the same address.
    pub fn initialize(&self, local_id: &str) -> Result<PeerId> {
        let peer = PeerId::new(local_id);
        let glue = SignalingGlue::new(peer.clone());
        let join = glue.join_room(&self.user_name);
        *self.glue.write() = Some(glue);

        self.sink.send_message(&join)?;
        info!(peer = %peer, "Joined mesh");
        Ok(peer)
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.glue.read().as_ref().map(|g| g.local().clone())
    }

    /// Decode a room message into a mesh event addressed to us
    pub fn route(&self, message: &Message) -> Option<MeshEvent> {
        self.glue.read().as_ref()?.route(message)
    }

    /// Acquire camera and microphone once; later calls return the same handle
    pub async fn start_local_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        let _gate = self.media_gate.lock().await;

        let existing = self.local_media.lock().clone();
        if let Some(stream) = existing {
            return Ok(stream);
        }

        let stream = self
            .devices
            .get_user_media(&constraints)
            .await
            .map_err(|e| {
                warn!(error = %e, "Local media unavailable");
                e
            })?;

        info!(tracks = stream.tracks().len(), "Local media started");
        *self.local_media.lock() = Some(stream.clone());
        Ok(stream)
    }

    pub fn local_media(&self) -> Option<MediaStream> {
        self.local_media.lock().clone()
    }

    /// Offer a connection to `peer`. A peer that already has a live link is
    /// not called again.
    pub async fn call_peer(&self, peer: &PeerId) -> Result<()> {
        let glue = self.glue()?;
        if peer == glue.local() {
            return Err(MeshError::InvalidSignal("cannot call ourselves".into()));
        }
        if self.link_state(peer).map_or(false, PeerLinkState::is_live) {
            debug!(peer = %peer, "Already linked");
            return Ok(());
        }

        let connection = self.open_link(peer, true).await?;
        let local = self.local_media();

        match connection.create_offer(local.as_ref()).await {
            Ok(sdp) => {
                self.apply_screen(peer, connection.as_ref()).await;
                info!(peer = %peer, "Calling peer");
                self.send_signal(&glue, peer, &SignalPayload::Offer { sdp })
            }
            Err(e) => {
                self.fail_link(peer, &e);
                Err(e)
            }
        }
    }

    /// Apply one inbound mesh event. Failures only affect the peer involved.
    pub async fn handle_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::ExistingPeers(peers) => {
                info!(count = peers.len(), "Calling existing peers");
                // The roster is the whole mesh; anyone missing left while we
                // were away
                let listed: HashSet<&str> = peers.iter().map(|p| p.peer_id.as_str()).collect();
                let gone: Vec<PeerId> = self
                    .links
                    .lock()
                    .keys()
                    .filter(|peer| !listed.contains(peer.as_str()))
                    .cloned()
                    .collect();
                for peer in gone {
                    debug!(peer = %peer, "Dropping link to a peer no longer in the mesh");
                    self.close_link(&peer);
                }

                for entry in peers {
                    let peer = PeerId::new(entry.peer_id);
                    self.names.lock().insert(peer.clone(), entry.user_name);
                    // We just (re)joined, so any link we still hold is from
                    // before and the other side may no longer have it
                    if self.link_state(&peer).is_some() {
                        self.hang_up(&peer);
                    }
                    if let Err(e) = self.call_peer(&peer).await {
                        warn!(peer = %peer, error = %e, "Call failed");
                    }
                }
            }
            MeshEvent::PeerJoined { peer_id, user_name } => {
                debug!(peer = %peer_id, "Peer joined, awaiting its offer");
                self.names.lock().insert(peer_id, user_name);
            }
            MeshEvent::PeerLeft { peer_id } => {
                self.close_link(&peer_id);
                self.names.lock().remove(&peer_id);
            }
            MeshEvent::Signal { from, payload } => {
                let kind = payload.name();
                if let Err(e) = self.handle_signal(&from, payload).await {
                    warn!(peer = %from, signal = kind, error = %e, "Signal failed");
                }
            }
        }
    }

    async fn handle_signal(&self, from: &PeerId, payload: SignalPayload) -> Result<()> {
        let glue = self.glue()?;

        match payload {
            SignalPayload::Offer { sdp } => {
                if self.link_state(from).map_or(false, PeerLinkState::is_live) {
                    warn!(peer = %from, "Ignoring offer for a live link");
                    return Ok(());
                }

                let connection = self.open_link(from, false).await?;
                let local = self.local_media();
                match connection.accept_offer(&sdp, local.as_ref()).await {
                    Ok(answer) => {
                        self.apply_screen(from, connection.as_ref()).await;
                        self.send_signal(&glue, from, &SignalPayload::Answer { sdp: answer })
                    }
                    Err(e) => {
                        self.fail_link(from, &e);
                        Err(e)
                    }
                }
            }
            SignalPayload::Answer { sdp } => {
                let connection = {
                    let links = self.links.lock();
                    links
                        .get(from)
                        .filter(|l| l.is_initiator() && l.state() == PeerLinkState::Calling)
                        .and_then(PeerLink::connection)
                };
                let Some(connection) = connection else {
                    warn!(peer = %from, "Answer without a pending offer");
                    return Ok(());
                };

                if let Err(e) = connection.accept_answer(&sdp).await {
                    self.fail_link(from, &e);
                    return Err(e);
                }
                Ok(())
            }
            SignalPayload::Candidate(candidate) => match self.live_connection(from) {
                Some(connection) => connection.add_ice_candidate(&candidate).await,
                None => {
                    debug!(peer = %from, "Candidate for unknown link");
                    Ok(())
                }
            },
            SignalPayload::Hangup => {
                self.close_link(from);
                Ok(())
            }
        }
    }

    /// Apply one event reported by a peer connection
    pub async fn handle_link_event(&self, event: LinkEvent) {
        let peer = event.peer;

        match event.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                if self.live_connection(&peer).is_none() {
                    return;
                }
                let sent = self
                    .glue()
                    .and_then(|glue| self.send_signal(&glue, &peer, &SignalPayload::Candidate(candidate)));
                if let Err(e) = sent {
                    debug!(peer = %peer, error = %e, "Candidate not sent");
                }
            }
            LinkEventKind::RemoteStream(stream) => {
                let mut links = self.links.lock();
                match links.get_mut(&peer) {
                    Some(link) if link.state().is_live() => link.set_remote_stream(stream),
                    // Never keep media for a link that is gone
                    _ => stream.stop(),
                }
            }
            LinkEventKind::Connected => {
                let connected = {
                    let mut links = self.links.lock();
                    links
                        .get_mut(&peer)
                        .filter(|l| l.state() == PeerLinkState::Calling)
                        .map_or(false, |l| l.transition(PeerLinkState::Connected).is_ok())
                };
                if connected {
                    info!(peer = %peer, "Peer connected");
                    self.notify(&peer, PeerLinkState::Connected);
                }
            }
            LinkEventKind::Failed(reason) => {
                self.fail_link(&peer, &MeshError::negotiation(&peer, reason));
            }
            LinkEventKind::Closed => {
                info!(peer = %peer, "Peer hung up");
                self.close_link(&peer);
            }
        }
    }

    /// Take the receiver of connection events, for callers that drive the
    /// mesh themselves instead of using [`PeerMesh::pump`]
    pub fn take_link_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.link_rx.lock().take()
    }

    /// Process mesh events and connection events one at a time until
    /// `events` closes
    pub async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MeshEvent>) {
        let Some(mut link_events) = self.take_link_events() else {
            warn!("Mesh pump already running");
            return;
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(event) = link_events.recv() => self.handle_link_event(event).await,
            }
        }
        debug!("Mesh pump stopped");
    }

    /// Flip the microphone track; returns whether it is now enabled
    pub fn toggle_microphone(&self) -> Result<bool> {
        let stream = self.local_media().ok_or(MeshError::NoLocalMedia)?;
        let track = stream.audio_track().ok_or(MeshError::NoLocalMedia)?;
        Ok(Self::toggle(track))
    }

    /// Flip the camera track; returns whether it is now enabled
    pub fn toggle_camera(&self) -> Result<bool> {
        let stream = self.local_media().ok_or(MeshError::NoLocalMedia)?;
        let track = stream.video_track().ok_or(MeshError::NoLocalMedia)?;
        Ok(Self::toggle(track))
    }

    fn toggle(track: &MediaTrack) -> bool {
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        info!(kind = %track.kind(), enabled, "Toggled local track");
        enabled
    }

    pub fn microphone_enabled(&self) -> bool {
        self.local_media()
            .and_then(|s| s.audio_track().map(MediaTrack::is_enabled))
            .unwrap_or(false)
    }

    pub fn camera_enabled(&self) -> bool {
        self.local_media()
            .and_then(|s| s.video_track().map(MediaTrack::is_enabled))
            .unwrap_or(false)
    }

    /// Capture the screen and send it instead of the camera on every link
    pub async fn share_screen(&self) -> Result<MediaStream> {
        let _gate = self.media_gate.lock().await;

        let existing = self.screen.lock().clone();
        if let Some(screen) = existing {
            return Ok(screen);
        }

        let screen = self.devices.get_display_media().await?;
        *self.screen.lock() = Some(screen.clone());

        self.replace_outgoing_video(screen.video_track()).await;
        info!("Screen share started");
        let _ = self.notices.send(MeshNotice::ScreenShareChanged(true));
        Ok(screen)
    }

    /// Stop the screen capture and put the camera back on every link
    pub async fn stop_screen_share(&self) -> Result<()> {
        let _gate = self.media_gate.lock().await;

        let screen = self.screen.lock().take();
        let Some(screen) = screen else {
            return Ok(());
        };
        screen.stop();

        let camera = self.local_media().and_then(|s| s.video_track().cloned());
        self.replace_outgoing_video(camera.as_ref()).await;
        info!("Screen share stopped");
        let _ = self.notices.send(MeshNotice::ScreenShareChanged(false));
        Ok(())
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.lock().is_some()
    }

    /// Close every link without signaling, keeping local media and the mesh
    /// address. Used when the room channel was lost, since the relay has
    /// already told the other peers we left.
    pub fn reset_links(&self) {
        let links: Vec<PeerLink> = self.links.lock().drain().map(|(_, link)| link).collect();
        if links.is_empty() {
            return;
        }

        info!(count = links.len(), "Dropping links from the previous channel");
        for mut link in links {
            let peer = link.peer_id().clone();
            link.close();
            self.notify(&peer, PeerLinkState::Closed);
        }
    }

    /// Hang up on every peer and release all local media
    pub fn disconnect(&self) {
        let glue = self.glue.write().take();
        let links: Vec<PeerLink> = self.links.lock().drain().map(|(_, link)| link).collect();

        for mut link in links {
            let peer = link.peer_id().clone();
            if let Some(glue) = &glue {
                if let Err(e) = self.send_signal(glue, &peer, &SignalPayload::Hangup) {
                    debug!(peer = %peer, error = %e, "Hangup not sent");
                }
            }
            link.close();
            self.notify(&peer, PeerLinkState::Closed);
        }

        if let Some(screen) = self.screen.lock().take() {
            screen.stop();
        }
        if let Some(local) = self.local_media.lock().take() {
            local.stop();
        }
        self.names.lock().clear();
        info!("Mesh disconnected");
    }

    pub fn link_state(&self, peer: &PeerId) -> Option<PeerLinkState> {
        self.links.lock().get(peer).map(PeerLink::state)
    }

    pub fn remote_stream(&self, peer: &PeerId) -> Option<MediaStream> {
        self.links.lock().get(peer).and_then(|l| l.remote_stream().cloned())
    }

    /// Every link, ordered by peer id
    pub fn links(&self) -> Vec<LinkSnapshot> {
        let names = self.names.lock().clone();
        let mut links: Vec<LinkSnapshot> = self
            .links
            .lock()
            .values()
            .map(|link| LinkSnapshot {
                peer_id: link.peer_id().clone(),
                user_name: names.get(link.peer_id()).cloned(),
                state: link.state(),
                initiator: link.is_initiator(),
                has_remote_stream: link.remote_stream().is_some(),
            })
            .collect();
        links.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        links
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshNotice> {
        self.notices.subscribe()
    }

    fn glue(&self) -> Result<SignalingGlue> {
        self.glue.read().clone().ok_or(MeshError::NotInitialized)
    }

    async fn open_link(&self, peer: &PeerId, initiator: bool) -> Result<Arc<dyn PeerConnection>> {
        let events = ConnectionEvents::new(peer.clone(), self.link_tx.clone());
        let connection = self
            .connector
            .connect(peer, &self.config.ice_servers, events)
            .await?;

        let mut link = PeerLink::new(peer.clone(), initiator);
        link.attach(connection.clone(), self.local_media());
        link.transition(PeerLinkState::Calling)?;

        // A replaced link is closed by its drop
        let stale = self.links.lock().insert(peer.clone(), link);
        drop(stale);

        self.notify(peer, PeerLinkState::Calling);
        Ok(connection)
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Arc<dyn PeerConnection>> {
        self.links
            .lock()
            .get(peer)
            .filter(|l| l.state().is_live())
            .and_then(PeerLink::connection)
    }

    async fn apply_screen(&self, peer: &PeerId, connection: &dyn PeerConnection) {
        let track = self.screen.lock().as_ref().and_then(|s| s.video_track().cloned());
        if let Some(track) = track {
            if let Err(e) = connection.replace_video_track(Some(&track)).await {
                warn!(peer = %peer, error = %e, "Could not send screen to new link");
            }
        }
    }

    async fn replace_outgoing_video(&self, track: Option<&MediaTrack>) {
        let connections: Vec<(PeerId, Arc<dyn PeerConnection>)> = self
            .links
            .lock()
            .values()
            .filter(|l| l.state().is_live())
            .filter_map(|l| l.connection().map(|c| (l.peer_id().clone(), c)))
            .collect();

        for (peer, connection) in connections {
            if let Err(e) = connection.replace_video_track(track).await {
                warn!(peer = %peer, error = %e, "Track replacement failed");
            }
        }
    }

    fn send_signal(&self, glue: &SignalingGlue, peer: &PeerId, payload: &SignalPayload) -> Result<()> {
        let message = glue.signal(peer, payload)?;
        self.sink.send_message(&message)
    }

    /// Tell `peer` to drop its side of our link, then close ours
    fn hang_up(&self, peer: &PeerId) {
        let sent = self
            .glue()
            .and_then(|glue| self.send_signal(&glue, peer, &SignalPayload::Hangup));
        if let Err(e) = sent {
            debug!(peer = %peer, error = %e, "Hangup not sent");
        }
        debug!(peer = %peer, "Replacing stale link");
        self.close_link(peer);
    }

    fn fail_link(&self, peer: &PeerId, error: &MeshError) {
        warn!(peer = %peer, error = %error, "Closing failed link");
        self.close_link(peer);
    }

    fn close_link(&self, peer: &PeerId) -> bool {
        let link = self.links.lock().remove(peer);
        match link {
            Some(mut link) => {
                link.close();
                self.notify(peer, PeerLinkState::Closed);
                true
            }
            None => false,
        }
    }

    fn notify(&self, peer: &PeerId, state: PeerLinkState) {
        let _ = self.notices.send(MeshNotice::LinkStateChanged {
            peer_id: peer.clone(),
            state,
        });
    }
}

impl Drop for PeerMesh {
    fn drop(&mut self) {
        for (_, mut link) in self.links.get_mut().drain() {
            link.close();
        }
        if let Some(local) = self.local_media.get_mut().take() {
            local.stop();
        }
        if let Some(screen) = self.screen.get_mut().take() {
            screen.stop();
        }
    }
}
