//! In-memory media and connection backends
//!
//! Stand-ins for a real capture/WebRTC stack. Negotiation always succeeds
//! unless a peer was marked as failing, and every connection produces a
//! synthetic remote stream.

use crate::error::{MeshError, Result};
use crate::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::peer::PeerId;
use crate::signaling::{
    ConnectionEvents, IceCandidate, IceServer, LinkEventKind, PeerConnection, PeerConnector,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const OFFER_PREFIX: &str = "memory-offer";
const ANSWER_PREFIX: &str = "memory-answer";

/// Fake camera, microphone and screen
#[derive(Debug, Default)]
pub struct MemoryDevices {
    deny: AtomicBool,
    user_media_requests: AtomicUsize,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices that refuse every capture request
    pub fn denying() -> Self {
        let devices = Self::default();
        devices.deny.store(true, Ordering::SeqCst);
        devices
    }

    pub fn set_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// How often the permission prompt would have been shown
    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for MemoryDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(MeshError::MediaAccessDenied("permission dismissed".into()));
        }
        if !constraints.audio && !constraints.video {
            return Err(MeshError::MediaAccessDenied("no media requested".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "memory microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "memory camera"));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MeshError::MediaAccessDenied("screen capture refused".into()));
        }
        Ok(MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "memory screen")]))
    }
}

/// Creates [`MemoryConnection`]s and keeps them for inspection
#[derive(Default)]
pub struct MemoryConnector {
    failing: Mutex<HashSet<PeerId>>,
    connections: Mutex<HashMap<PeerId, Arc<MemoryConnection>>>,
    offers: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make negotiation with `peer` fail
    pub fn fail_peer(&self, peer: impl Into<PeerId>) {
        self.failing.lock().insert(peer.into());
    }

    /// Latest connection created for `peer`
    pub fn connection(&self, peer: &PeerId) -> Option<Arc<MemoryConnection>> {
        self.connections.lock().get(peer).cloned()
    }

    /// Number of offers created across all connections
    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        _ice_servers: &[IceServer],
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(MemoryConnection {
            peer: peer.clone(),
            events,
            fail: self.failing.lock().contains(peer),
            closed: AtomicBool::new(false),
            outgoing_video: Mutex::new(None),
            remote_candidates: AtomicUsize::new(0),
            offers: self.offers.clone(),
        });
        self.connections.lock().insert(peer.clone(), connection.clone());
        Ok(connection)
    }
}

/// Simulated direct connection to one peer
pub struct MemoryConnection {
    peer: PeerId,
    events: ConnectionEvents,
    fail: bool,
    closed: AtomicBool,
    outgoing_video: Mutex<Option<MediaTrack>>,
    remote_candidates: AtomicUsize,
    offers: Arc<AtomicUsize>,
}

impl MemoryConnection {
    /// Video track currently sent to the peer
    pub fn outgoing_video(&self) -> Option<MediaTrack> {
        self.outgoing_video.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }

    /// Simulate the remote side hanging up
    pub fn hang_up(&self) {
        self.events.emit(LinkEventKind::Closed);
    }

    fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::negotiation(&self.peer, "connection closed"));
        }
        if self.fail {
            return Err(MeshError::negotiation(&self.peer, "ICE gathering failed"));
        }
        Ok(())
    }

    fn publish(&self, local: Option<&MediaStream>) {
        *self.outgoing_video.lock() = local.and_then(|s| s.video_track().cloned());
    }

    fn remote_media(&self) -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, format!("{} microphone", self.peer)),
            MediaTrack::new(TrackKind::Video, format!("{} camera", self.peer)),
        ])
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_offer(&self, local: Option<&MediaStream>) -> Result<String> {
        self.check()?;
        self.publish(local);
        self.offers.fetch_add(1, Ordering::SeqCst);
        self.events.emit(LinkEventKind::LocalCandidate(IceCandidate {
            candidate: format!("candidate:memory {}", self.peer),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        Ok(format!("{}:{}", OFFER_PREFIX, self.peer))
    }

    async fn accept_offer(&self, sdp: &str, local: Option<&MediaStream>) -> Result<String> {
        self.check()?;
        if !sdp.starts_with(OFFER_PREFIX) {
            return Err(MeshError::negotiation(&self.peer, "unreadable offer"));
        }
        self.publish(local);
        self.events.emit(LinkEventKind::RemoteStream(self.remote_media()));
        self.events.emit(LinkEventKind::Connected);
        Ok(format!("{}:{}", ANSWER_PREFIX, self.peer))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        self.check()?;
        if !sdp.starts_with(ANSWER_PREFIX) {
            return Err(MeshError::negotiation(&self.peer, "unreadable answer"));
        }
        self.events.emit(LinkEventKind::RemoteStream(self.remote_media()));
        self.events.emit(LinkEventKind::Connected);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::negotiation(&self.peer, "connection closed"));
        }
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::negotiation(&self.peer, "connection closed"));
        }
        *self.outgoing_video.lock() = track.cloned();
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
