//! Huddle Mesh - full-mesh peer media
//!
//! Every participant holds one direct link to every other participant.
//! Negotiation is carried over the room channel as `webrtc-*` messages:
//! - SignalingGlue: maps offers, answers and candidates onto room messages
//! - PeerMesh: link lifecycle, local media and screen sharing
//! - memory: in-process media and connection backends
//! - rtc: `webrtc` crate backend (feature `webrtc`)

pub mod error;
pub mod manager;
pub mod media;
pub mod memory;
pub mod peer;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod signaling;

pub use error::{MeshError, Result};
pub use manager::{LinkSnapshot, MeshConfig, MeshNotice, PeerMesh};
pub use media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
pub use memory::{MemoryConnection, MemoryConnector, MemoryDevices};
pub use peer::{PeerId, PeerLink, PeerLinkState};
#[cfg(feature = "webrtc")]
pub use rtc::{RtcConnection, RtcConnector};
pub use signaling::{
    ConnectionEvents, IceCandidate, IceServer, LinkEvent, LinkEventKind, MeshEvent, PeerConnection,
    PeerConnector, SignalPayload, SignalSink, SignalingGlue,
};
