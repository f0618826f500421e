//! Huddle relay protocol
//!
//! JSON text frames with a `type` discriminator, one channel per room.
//!
//! ```text
//! {"type":"join","userId":"u1","userName":"Ada"}
//! {"type":"update","data":[145,...]}
//! {"type":"webrtc-signal","targetPeerId":"p2","fromPeerId":"p1","signal":{...}}
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::Codec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{Message, MessageKind, PeerEntry};
