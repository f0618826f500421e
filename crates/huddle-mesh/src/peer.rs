//! Per-peer link state

use crate::error::{MeshError, Result};
use crate::media::MediaStream;
use crate::signaling::PeerConnection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Address of a participant in the mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Link lifecycle: `Idle -> Calling -> Connected -> Closed`, with
/// `Calling -> Closed` and `Connected -> Closed` on hangup or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerLinkState {
    Idle,
    Calling,
    Connected,
    Closed,
}

impl PeerLinkState {
    pub fn can_transition_to(self, next: PeerLinkState) -> bool {
        use PeerLinkState::*;
        matches!(
            (self, next),
            (Idle, Calling) | (Idle, Closed) | (Calling, Connected) | (Calling, Closed) | (Connected, Closed)
        )
    }

    /// Calling or connected
    pub fn is_live(self) -> bool {
        matches!(self, PeerLinkState::Calling | PeerLinkState::Connected)
    }
}

impl fmt::Display for PeerLinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerLinkState::Idle => "idle",
            PeerLinkState::Calling => "calling",
            PeerLinkState::Connected => "connected",
            PeerLinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One remote participant in the mesh
pub struct PeerLink {
    peer_id: PeerId,
    state: PeerLinkState,
    /// Whether this side sent the offer
    initiator: bool,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    connection: Option<Arc<dyn PeerConnection>>,
}

impl PeerLink {
    pub fn new(peer_id: PeerId, initiator: bool) -> Self {
        Self {
            peer_id,
            state: PeerLinkState::Idle,
            initiator,
            local_stream: None,
            remote_stream: None,
            connection: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> PeerLinkState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.clone()
    }

    pub fn attach(&mut self, connection: Arc<dyn PeerConnection>, local_stream: Option<MediaStream>) {
        self.connection = Some(connection);
        self.local_stream = local_stream;
    }

    /// Attach the remote stream; replaces and stops a previous one
    /// Replace the remote stream. Tracks the new stream carries over from
    /// the old one keep playing.
    pub fn set_remote_stream(&mut self, stream: MediaStream) {
        if let Some(old) = self.remote_stream.replace(stream) {
            let kept = self.remote_stream.as_ref().map(MediaStream::tracks).unwrap_or_default();
            for track in old.tracks().iter().filter(|t| !kept.contains(t)) {
                track.stop();
            }
        }
    }

    pub fn transition(&mut self, next: PeerLinkState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(peer = %self.peer_id, from = %self.state, to = %next, "Link transition");
        self.state = next;
        Ok(())
    }

    /// Close the connection and release remote media. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.remote_stream.take() {
            stream.stop();
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        // The local stream is shared with other links; only drop our handle
        self.local_stream = None;

        if self.state != PeerLinkState::Closed {
            debug!(peer = %self.peer_id, from = %self.state, "Link closed");
            self.state = PeerLinkState::Closed;
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("initiator", &self.initiator)
            .field("remote_stream", &self.remote_stream.is_some())
            .finish()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};

    #[test]
    fn test_happy_path_transitions() {
        let mut link = PeerLink::new("p".into(), true);
        assert_eq!(link.state(), PeerLinkState::Idle);

        link.transition(PeerLinkState::Calling).unwrap();
        link.transition(PeerLinkState::Connected).unwrap();
        link.transition(PeerLinkState::Closed).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut link = PeerLink::new("p".into(), false);
        assert!(link.transition(PeerLinkState::Connected).is_err());

        link.transition(PeerLinkState::Calling).unwrap();
        assert!(link.transition(PeerLinkState::Idle).is_err());

        link.close();
        assert!(link.transition(PeerLinkState::Calling).is_err());
    }

    #[test]
    fn test_close_stops_remote_media() {
        let remote = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "remote")]);
        let mut link = PeerLink::new("p".into(), true);
        link.transition(PeerLinkState::Calling).unwrap();
        link.set_remote_stream(remote.clone());

        link.close();
        assert_eq!(link.state(), PeerLinkState::Closed);
        assert!(!remote.is_live());
        assert!(link.remote_stream().is_none());
    }

    #[test]
    fn test_growing_remote_stream_keeps_tracks() {
        let audio = MediaTrack::new(TrackKind::Audio, "remote mic");
        let video = MediaTrack::new(TrackKind::Video, "remote cam");
        let mut link = PeerLink::new("p".into(), true);

        link.set_remote_stream(MediaStream::new(vec![audio.clone()]));
        link.set_remote_stream(MediaStream::new(vec![audio.clone(), video.clone()]));
        assert!(audio.is_live());

        let other = MediaTrack::new(TrackKind::Video, "replacement");
        link.set_remote_stream(MediaStream::new(vec![other]));
        assert!(!audio.is_live());
        assert!(!video.is_live());
    }

    #[test]
    fn test_close_keeps_local_media() {
        let local = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "mic")]);
        let mut link = PeerLink::new("p".into(), true);
        link.local_stream = Some(local.clone());

        link.close();
        assert!(local.is_live());
    }

    #[test]
    fn test_drop_releases_remote_media() {
        let remote = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "remote")]);
        {
            let mut link = PeerLink::new("p".into(), false);
            link.set_remote_stream(remote.clone());
        }
        assert!(!remote.is_live());
    }
}
