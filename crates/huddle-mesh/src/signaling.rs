//! Signaling glue between the mesh and the room channel
//!
//! The relay only sees three shapes: `webrtc-join-room`, the
//! `webrtc-existing-peers` roster it sends back to a newcomer, and
//! `webrtc-signal` frames addressed to one peer. The `signal` field is
//! opaque to the relay; this module owns its format.

use crate::error::{MeshError, Result};
use crate::media::{MediaStream, MediaTrack};
use crate::peer::PeerId;
use async_trait::async_trait;
use huddle_protocol::{Message, PeerEntry};
use huddle_transport::TransportClient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// ICE server entry handed to the connection backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Negotiation payload carried in `webrtc-signal`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    Hangup,
}

impl SignalPayload {
    pub fn name(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate(_) => "candidate",
            SignalPayload::Hangup => "hangup",
        }
    }
}

/// Inbound mesh activity decoded from room messages
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Sent only to us, right after we joined the mesh
    ExistingPeers(Vec<PeerEntry>),
    PeerJoined { peer_id: PeerId, user_name: String },
    PeerLeft { peer_id: PeerId },
    Signal { from: PeerId, payload: SignalPayload },
}

/// Maps mesh negotiation to room messages and back
#[derive(Debug, Clone)]
pub struct SignalingGlue {
    local: PeerId,
}

impl SignalingGlue {
    pub fn new(local: PeerId) -> Self {
        Self { local }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Mesh presence announcement
    pub fn join_room(&self, user_name: &str) -> Message {
        Message::WebrtcJoinRoom {
            peer_id: self.local.to_string(),
            user_name: user_name.to_string(),
        }
    }

    /// Wrap a payload for one peer
    pub fn signal(&self, target: &PeerId, payload: &SignalPayload) -> Result<Message> {
        let signal = serde_json::to_value(payload).map_err(|e| MeshError::InvalidSignal(e.to_string()))?;
        Ok(Message::WebrtcSignal {
            target_peer_id: target.to_string(),
            from_peer_id: self.local.to_string(),
            signal,
        })
    }

    /// Translate a room message into a mesh event. Returns `None` for
    /// messages that are not mesh traffic or not meant for us.
    pub fn route(&self, message: &Message) -> Option<MeshEvent> {
        match message {
            Message::WebrtcExistingPeers { peers } => Some(MeshEvent::ExistingPeers(
                peers
                    .iter()
                    .filter(|p| p.peer_id != self.local.as_str())
                    .cloned()
                    .collect(),
            )),
            Message::WebrtcPeerJoined { peer_id, user_name } => {
                (peer_id != self.local.as_str()).then(|| MeshEvent::PeerJoined {
                    peer_id: PeerId::new(peer_id.clone()),
                    user_name: user_name.clone(),
                })
            }
            Message::WebrtcPeerLeft { peer_id } => {
                (peer_id != self.local.as_str()).then(|| MeshEvent::PeerLeft {
                    peer_id: PeerId::new(peer_id.clone()),
                })
            }
            Message::WebrtcSignal {
                target_peer_id,
                from_peer_id,
                signal,
            } => {
                if target_peer_id != self.local.as_str() {
                    debug!(target = %target_peer_id, "Ignoring signal for another peer");
                    return None;
                }
                match serde_json::from_value::<SignalPayload>(signal.clone()) {
                    Ok(payload) => Some(MeshEvent::Signal {
                        from: PeerId::new(from_peer_id.clone()),
                        payload,
                    }),
                    Err(e) => {
                        warn!(from = %from_peer_id, error = %e, "Dropping unreadable signal");
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

/// Where the mesh writes its outbound signaling
pub trait SignalSink: Send + Sync {
    fn send_message(&self, message: &Message) -> Result<()>;
}

impl SignalSink for TransportClient {
    fn send_message(&self, message: &Message) -> Result<()> {
        self.send(message)?;
        Ok(())
    }
}

/// Connection-level happenings reported by a [`PeerConnection`]
#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// Trickle ICE candidate to forward to the remote peer
    LocalCandidate(IceCandidate),
    RemoteStream(MediaStream),
    Connected,
    Failed(String),
    /// Remote side hung up
    Closed,
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer: PeerId,
    pub kind: LinkEventKind,
}

/// Handle a connection uses to report events for one peer
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    peer: PeerId,
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl ConnectionEvents {
    pub fn new(peer: PeerId, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { peer, sender }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn emit(&self, kind: LinkEventKind) {
        let _ = self.sender.send(LinkEvent {
            peer: self.peer.clone(),
            kind,
        });
    }
}

/// Creates direct connections to peers (a WebRTC stack in production)
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer: &PeerId,
        ice_servers: &[IceServer],
        events: ConnectionEvents,
    ) -> Result<std::sync::Arc<dyn PeerConnection>>;
}

/// One negotiated (or negotiating) direct connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the offer, publishing `local` media
    async fn create_offer(&self, local: Option<&MediaStream>) -> Result<String>;

    /// Apply a remote offer and produce the answer
    async fn accept_offer(&self, sdp: &str, local: Option<&MediaStream>) -> Result<String>;

    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Swap the outgoing video track without renegotiating
    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<()>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn glue() -> SignalingGlue {
        SignalingGlue::new(PeerId::new("me"))
    }

    #[test]
    fn test_signal_wire_format() {
        let msg = glue()
            .signal(&PeerId::new("you"), &SignalPayload::Offer { sdp: "v=0".into() })
            .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "webrtc-signal",
                "targetPeerId": "you",
                "fromPeerId": "me",
                "signal": {"type": "offer", "sdp": "v=0"}
            })
        );
    }

    #[test]
    fn test_candidate_format() {
        let payload = SignalPayload::Candidate(IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_route_signal_for_us() {
        let msg = Message::WebrtcSignal {
            target_peer_id: "me".into(),
            from_peer_id: "p1".into(),
            signal: json!({"type": "answer", "sdp": "a"}),
        };
        assert_eq!(
            glue().route(&msg),
            Some(MeshEvent::Signal {
                from: PeerId::new("p1"),
                payload: SignalPayload::Answer { sdp: "a".into() }
            })
        );
    }

    #[test]
    fn test_route_ignores_other_targets_and_garbage() {
        let other = Message::WebrtcSignal {
            target_peer_id: "someone".into(),
            from_peer_id: "p1".into(),
            signal: json!({"type": "hangup"}),
        };
        assert_eq!(glue().route(&other), None);

        let garbage = Message::WebrtcSignal {
            target_peer_id: "me".into(),
            from_peer_id: "p1".into(),
            signal: json!({"type": "teleport"}),
        };
        assert_eq!(glue().route(&garbage), None);
    }

    #[test]
    fn test_route_membership() {
        let joined_self = Message::WebrtcPeerJoined {
            peer_id: "me".into(),
            user_name: "Me".into(),
        };
        assert_eq!(glue().route(&joined_self), None);

        let roster = Message::WebrtcExistingPeers {
            peers: vec![
                PeerEntry {
                    peer_id: "me".into(),
                    user_name: "Me".into(),
                },
                PeerEntry {
                    peer_id: "a".into(),
                    user_name: "A".into(),
                },
            ],
        };
        match glue().route(&roster) {
            Some(MeshEvent::ExistingPeers(peers)) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, "a");
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert_eq!(glue().route(&Message::SyncRequest), None);
    }
}
