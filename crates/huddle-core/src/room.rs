//! Room registry - relay-side rooms, membership and fan-out

use crate::document::{Document, RoomId};
use crate::error::{Error, Result};
use crate::presence::{color_for, CursorPosition, Participant};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Connection identifier assigned by the relay
pub type ConnectionId = u64;

/// Replica id the relay's own document copy uses; it never authors operations
pub const RELAY_REPLICA: u64 = 0;

/// Envelopes a connection may fall behind by before it misses traffic
pub const ROOM_CHANNEL_CAPACITY: usize = 1024;

/// Serialized message fanned out to the connections of a room
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ConnectionId,
    /// `None` delivers to every connection except the sender
    pub target: Option<ConnectionId>,
    pub payload: Arc<str>,
}

impl Envelope {
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        match self.target {
            Some(target) => target == conn,
            None => self.from != conn,
        }
    }
}

/// One connection attached to a room
#[derive(Debug, Clone, Default)]
pub struct Member {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub peer_id: Option<String>,
    pub cursor: Option<CursorPosition>,
}

/// A mesh participant as listed to a newcomer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPeer {
    pub peer_id: String,
    pub user_name: String,
}

/// A room on the relay: one document replica plus the attached connections
pub struct Room {
    id: RoomId,
    document: Document,
    members: RwLock<BTreeMap<ConnectionId, Member>>,
    sender: broadcast::Sender<Envelope>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        let (sender, _) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            document: Document::new(id.clone(), RELAY_REPLICA),
            id,
            members: RwLock::new(BTreeMap::new()),
            sender,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Attach a connection and return its fan-out receiver
    pub fn attach(&self, conn: ConnectionId) -> broadcast::Receiver<Envelope> {
        let rx = self.sender.subscribe();
        self.members.write().insert(conn, Member::default());
        debug!(room = %self.id, conn, "Connection attached");
        rx
    }

    /// Detach a connection, returning what it had announced
    pub fn detach(&self, conn: ConnectionId) -> Option<Member> {
        let member = self.members.write().remove(&conn);
        debug!(room = %self.id, conn, "Connection detached");
        member
    }

    /// Record the identity announced by `join`
    pub fn set_user(&self, conn: ConnectionId, user_id: &str, user_name: &str) {
        if let Some(member) = self.members.write().get_mut(&conn) {
            member.user_id = Some(user_id.to_string());
            member.user_name = Some(user_name.to_string());
        }
    }

    /// Forget what a connection announced after it left, keeping it attached
    pub fn clear_identity(&self, conn: ConnectionId) {
        if let Some(member) = self.members.write().get_mut(&conn) {
            *member = Member::default();
        }
    }

    /// Whether a connection other than `conn` announced `user_id`
    pub fn has_user_elsewhere(&self, conn: ConnectionId, user_id: &str) -> bool {
        self.members
            .read()
            .iter()
            .any(|(id, m)| *id != conn && m.user_id.as_deref() == Some(user_id))
    }

    pub fn user_id(&self, conn: ConnectionId) -> Option<String> {
        self.members.read().get(&conn).and_then(|m| m.user_id.clone())
    }

    pub fn set_cursor(&self, conn: ConnectionId, cursor: CursorPosition) {
        if let Some(member) = self.members.write().get_mut(&conn) {
            member.cursor = Some(cursor);
        }
    }

    /// Register a mesh peer id; returns the mesh peers that were already present
    pub fn join_mesh(&self, conn: ConnectionId, peer_id: &str, user_name: &str) -> Vec<MeshPeer> {
        let mut members = self.members.write();

        let existing = members
            .iter()
            .filter(|(id, _)| **id != conn)
            .filter_map(|(_, m)| {
                m.peer_id.as_ref().map(|peer_id| MeshPeer {
                    peer_id: peer_id.clone(),
                    user_name: m.user_name.clone().unwrap_or_else(|| peer_id.clone()),
                })
            })
            .collect();

        if let Some(member) = members.get_mut(&conn) {
            member.peer_id = Some(peer_id.to_string());
            if member.user_name.is_none() {
                member.user_name = Some(user_name.to_string());
            }
        }

        existing
    }

    /// Take `peer_id` away from any other connection still holding it (a
    /// client that reconnected before its old socket was noticed as dead).
    /// Returns `true` if another connection held it.
    pub fn claim_peer(&self, conn: ConnectionId, peer_id: &str) -> bool {
        let mut claimed = false;
        for (id, member) in self.members.write().iter_mut() {
            if *id != conn && member.peer_id.as_deref() == Some(peer_id) {
                member.peer_id = None;
                claimed = true;
            }
        }
        if claimed {
            debug!(room = %self.id, conn, peer = %peer_id, "Mesh peer moved connection");
        }
        claimed
    }

    /// Connection currently holding a mesh peer id
    pub fn connection_for_peer(&self, peer_id: &str) -> Option<ConnectionId> {
        self.members
            .read()
            .iter()
            .find(|(_, m)| m.peer_id.as_deref() == Some(peer_id))
            .map(|(id, _)| *id)
    }

    /// Participants that announced themselves, excluding `except`
    pub fn roster(&self, except: ConnectionId) -> Vec<Participant> {
        self.members
            .read()
            .iter()
            .filter(|(id, _)| **id != except)
            .filter_map(|(_, m)| {
                let user_id = m.user_id.as_ref()?;
                Some(Participant {
                    id: user_id.clone(),
                    display_name: m.user_name.clone().unwrap_or_else(|| user_id.clone()),
                    color: color_for(user_id).to_string(),
                    cursor: m.cursor,
                    media_state: None,
                })
            })
            .collect()
    }

    /// Fan a message out to every other connection
    pub fn broadcast(&self, from: ConnectionId, payload: Arc<str>) {
        let _ = self.sender.send(Envelope {
            from,
            target: None,
            payload,
        });
    }

    /// Deliver a message to one connection
    pub fn send_to(&self, from: ConnectionId, target: ConnectionId, payload: Arc<str>) {
        let _ = self.sender.send(Envelope {
            from,
            target: Some(target),
            payload,
        });
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &self.member_count())
            .finish()
    }
}

/// Room manager handles all live rooms on a relay
pub struct RoomManager {
    rooms: DashMap<String, Arc<Room>>,
    next_connection: AtomicU64,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new connection
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Get or create a room
    pub fn get_or_create(&self, id: RoomId) -> Arc<Room> {
        let key = id.as_str().to_string();

        self.rooms
            .entry(key)
            .or_insert_with(|| {
                info!(room = %id, "Room created");
                Arc::new(Room::new(id))
            })
            .value()
            .clone()
    }

    /// Attach `conn` to a room, creating the room if needed. The attach
    /// happens under the registry entry, so a concurrent [`release`] of the
    /// same room either runs first or sees the new member.
    ///
    /// [`release`]: RoomManager::release
    pub fn join(&self, id: RoomId, conn: ConnectionId) -> (Arc<Room>, broadcast::Receiver<Envelope>) {
        let key = id.as_str().to_string();
        let entry = self.rooms.entry(key).or_insert_with(|| {
            info!(room = %id, "Room created");
            Arc::new(Room::new(id))
        });
        let rx = entry.value().attach(conn);
        (entry.value().clone(), rx)
    }

    /// Get an existing room
    pub fn get(&self, id: &RoomId) -> Result<Arc<Room>> {
        self.rooms
            .get(id.as_str())
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::RoomNotFound(id.to_string()))
    }

    /// Drop a room (and its document) once nobody is attached.
    /// Returns `true` if the room was removed.
    pub fn release(&self, id: &RoomId) -> bool {
        let removed = self
            .rooms
            .remove_if(id.as_str(), |_, room| room.is_empty())
            .is_some();
        if removed {
            info!(room = %id, "Room reclaimed");
        }
        removed
    }

    /// Remove every empty room. Returns the number of rooms removed.
    pub fn gc(&self) -> usize {
        let empty: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        empty
            .into_iter()
            .filter(|key| self.rooms.remove_if(key, |_, room| room.is_empty()).is_some())
            .count()
    }

    pub fn list(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.value().id().clone()).collect()
    }

    /// Get statistics
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            room_count: self.rooms.len(),
            connection_count: self.rooms.iter().map(|r| r.value().member_count()).sum(),
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Manager statistics
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub room_count: usize,
    pub connection_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_id(s: &str) -> RoomId {
        RoomId::new(s).unwrap()
    }

    #[test]
    fn test_get_or_create_is_shared() {
        let manager = RoomManager::new();
        let a = manager.get_or_create(room_id("r1"));
        let b = manager.get_or_create(room_id("r1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.stats().room_count, 1);
    }

    #[test]
    fn test_release_only_when_empty() {
        let manager = RoomManager::new();
        let room = manager.get_or_create(room_id("r1"));
        let conn = manager.next_connection_id();
        let _rx = room.attach(conn);

        assert!(!manager.release(room.id()));
        room.detach(conn);
        assert!(manager.release(room.id()));
        assert!(manager.get(&room_id("r1")).is_err());
    }

    #[test]
    fn test_join_while_last_member_leaves() {
        let manager = RoomManager::new();
        let (first, _rx1) = manager.join(room_id("r1"), 1);

        // Last member detaches, a newcomer joins before the release runs
        first.detach(1);
        let (second, _rx2) = manager.join(room_id("r1"), 2);
        assert!(!manager.release(first.id()));

        let (third, _rx3) = manager.join(room_id("r1"), 3);
        assert!(Arc::ptr_eq(&second, &third));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(third.member_count(), 2);
        assert_eq!(manager.gc(), 0);
    }

    #[test]
    fn test_release_then_join_gets_fresh_room() {
        let manager = RoomManager::new();
        let (first, _rx1) = manager.join(room_id("r1"), 1);
        first.detach(1);
        assert!(manager.release(first.id()));

        let (second, _rx2) = manager.join(room_id("r1"), 2);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.stats().connection_count, 1);
    }

    #[test]
    fn test_room_document_reclaimed() {
        let manager = RoomManager::new();
        let room = manager.get_or_create(room_id("r1"));
        let update = Document::new(room_id("r1"), 7)
            .apply_local_change("hi")
            .unwrap()
            .unwrap();
        room.document().apply_update(&update).unwrap();
        manager.release(room.id());

        let fresh = manager.get_or_create(room_id("r1"));
        assert_eq!(fresh.document().text(), "");
    }

    #[test]
    fn test_gc_removes_empty_rooms() {
        let manager = RoomManager::new();
        let busy = manager.get_or_create(room_id("busy"));
        let _rx = busy.attach(1);
        manager.get_or_create(room_id("idle"));

        assert_eq!(manager.gc(), 1);
        assert_eq!(manager.list(), vec![room_id("busy")]);
    }

    #[test]
    fn test_join_mesh_lists_existing_peers() {
        let room = Room::new(room_id("r1"));
        let _a = room.attach(1);
        let _b = room.attach(2);
        let _c = room.attach(3);

        assert!(room.join_mesh(1, "pa", "A").is_empty());
        assert_eq!(room.join_mesh(2, "pb", "B").len(), 1);

        let existing = room.join_mesh(3, "pc", "C");
        let ids: Vec<&str> = existing.iter().map(|p| p.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["pa", "pb"]);
        assert_eq!(room.connection_for_peer("pb"), Some(2));
    }

    #[test]
    fn test_claim_peer_moves_mesh_address() {
        let room = Room::new(room_id("r1"));
        let _old = room.attach(1);
        let _new = room.attach(2);
        room.join_mesh(1, "pb", "B");

        assert!(room.claim_peer(2, "pb"));
        assert!(room.join_mesh(2, "pb", "B").is_empty());
        assert_eq!(room.connection_for_peer("pb"), Some(2));
        assert!(!room.claim_peer(2, "pb"));
    }

    #[test]
    fn test_has_user_elsewhere() {
        let room = Room::new(room_id("r1"));
        let _a = room.attach(1);
        let _b = room.attach(2);
        room.set_user(1, "u1", "Ada");

        assert!(!room.has_user_elsewhere(1, "u1"));
        room.set_user(2, "u1", "Ada");
        assert!(room.has_user_elsewhere(1, "u1"));
    }

    #[test]
    fn test_roster_excludes_requester_and_anonymous() {
        let room = Room::new(room_id("r1"));
        let _a = room.attach(1);
        let _b = room.attach(2);
        let _c = room.attach(3);
        room.set_user(1, "u1", "Ada");
        room.set_user(2, "u2", "Bob");
        room.set_cursor(2, CursorPosition::new(3, 4));

        let roster = room.roster(1);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "u2");
        assert_eq!(roster[0].cursor, Some(CursorPosition::new(3, 4)));
    }

    #[tokio::test]
    async fn test_envelope_targeting() {
        let room = Room::new(room_id("r1"));
        let mut rx = room.attach(2);

        room.broadcast(1, Arc::from("hello"));
        room.send_to(1, 3, Arc::from("not yours"));
        room.broadcast(2, Arc::from("own echo"));

        let mut delivered = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if env.is_for(2) {
                delivered.push(env.payload.to_string());
            }
        }
        assert_eq!(delivered, vec!["hello"]);
    }
}
