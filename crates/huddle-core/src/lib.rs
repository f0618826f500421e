//! Huddle Core - Replicated Document Engine and Presence
//!
//! This crate provides the core functionality for Huddle:
//! - An operation-log CRDT for collaboratively edited text
//! - Replicated documents addressed by room identifiers
//! - Presence/awareness tracking of room participants
//! - The relay-side room registry

pub mod document;
pub mod error;
pub mod oplog;
pub mod presence;
pub mod room;

pub use document::{new_replica_id, Document, DocumentMeta, RoomId};
pub use error::{Error, Result};
pub use oplog::{Op, OpId, OpLog, ReplicaId, Update};
pub use presence::{color_for, CursorPosition, MediaState, Participant, PresenceTracker};
pub use room::{ConnectionId, Envelope, MeshPeer, Room, RoomManager, ROOM_CHANNEL_CAPACITY};
