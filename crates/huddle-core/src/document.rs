//! Replicated document types and operations

use crate::error::{Error, Result};
use crate::oplog::{OpLog, ReplicaId, Update};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

/// Room identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    /// Create a new room ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidRoomId("Room ID cannot be empty".into()));
        }

        if id.len() > 512 {
            return Err(Error::InvalidRoomId("Room ID exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_-]+
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-') {
            return Err(Error::InvalidRoomId(
                "Room ID must match pattern [a-zA-Z0-9:_-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RoomId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Pick a fresh replica id for a newly opened document
pub fn new_replica_id() -> ReplicaId {
    Uuid::new_v4().as_u64_pair().0
}

/// Document metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub room: RoomId,
    pub replica: ReplicaId,
    pub created_at: u64,
    pub updated_at: u64,
    pub version: u64,
}

impl DocumentMeta {
    pub fn new(room: RoomId, replica: ReplicaId) -> Self {
        let now = now_millis();

        Self {
            room,
            replica,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// One replica of a collaboratively edited text document
pub struct Document {
    meta: RwLock<DocumentMeta>,
    log: RwLock<OpLog>,
}

impl Document {
    /// Create an empty replica with the given id
    pub fn new(room: RoomId, replica: ReplicaId) -> Self {
        Self {
            meta: RwLock::new(DocumentMeta::new(room, replica)),
            log: RwLock::new(OpLog::new()),
        }
    }

    /// Create an empty replica with a random replica id
    pub fn open(room: RoomId) -> Self {
        Self::new(room, new_replica_id())
    }

    pub fn room(&self) -> RoomId {
        self.meta.read().room.clone()
    }

    pub fn replica(&self) -> ReplicaId {
        self.meta.read().replica
    }

    pub fn meta(&self) -> DocumentMeta {
        self.meta.read().clone()
    }

    /// Number of changes applied so far
    pub fn version(&self) -> u64 {
        self.meta.read().version
    }

    /// Current materialized text
    pub fn text(&self) -> String {
        self.log.read().text()
    }

    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Operations still waiting for a causal dependency
    pub fn pending_ops(&self) -> usize {
        self.log.read().pending_len()
    }

    /// Replace the text with `new_text`, returning the update to broadcast.
    ///
    /// The change is visible through [`Document::text`] immediately. Returns
    /// `None` when the text is unchanged.
    pub fn apply_local_change(&self, new_text: &str) -> Result<Option<Update>> {
        let replica = self.replica();
        let update = self.log.write().local_edit(replica, new_text)?;

        if update.is_empty() {
            return Ok(None);
        }

        debug!(ops = update.len(), "Applied local change");
        self.update_version();
        Ok(Some(update))
    }

    /// Merge an encoded update from another replica.
    ///
    /// Returns the number of newly integrated operations; zero means the
    /// update was a duplicate (or is waiting for missing dependencies).
    pub fn apply_remote_update(&self, data: &[u8]) -> Result<usize> {
        let update = Update::decode(data)?;
        self.apply_update(&update)
    }

    /// Merge an already decoded update
    pub fn apply_update(&self, update: &Update) -> Result<usize> {
        let integrated = self.log.write().apply(update)?;
        if integrated > 0 {
            debug!(ops = integrated, "Applied remote update");
            self.update_version();
        }
        Ok(integrated)
    }

    /// Full state as an encoded update (answers a sync request)
    pub fn encode_state(&self) -> Result<Vec<u8>> {
        self.log.read().snapshot().encode()
    }

    /// Every operation this replica created, for re-broadcast after a reconnect
    pub fn authored_update(&self) -> Update {
        let replica = self.replica();
        self.log.read().authored_by(replica)
    }

    fn update_version(&self) {
        let mut meta = self.meta.write();
        meta.version += 1;
        meta.updated_at = now_millis();
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("meta", &self.meta)
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::new("project:42").unwrap()
    }

    #[test]
    fn test_room_id_valid() {
        assert!(RoomId::new("project:123").is_ok());
        assert!(RoomId::new("doc_main-rs").is_ok());
    }

    #[test]
    fn test_room_id_invalid() {
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("project/123").is_err()); // invalid char
        assert!(RoomId::new("a".repeat(513)).is_err()); // too long
    }

    #[test]
    fn test_local_change_is_optimistic() {
        let doc = Document::new(room(), 1);

        let update = doc.apply_local_change("let x = 1;").unwrap();
        assert!(update.is_some());
        assert_eq!(doc.text(), "let x = 1;");
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_unchanged_text_produces_no_update() {
        let doc = Document::new(room(), 1);
        doc.apply_local_change("abc").unwrap();

        assert!(doc.apply_local_change("abc").unwrap().is_none());
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_remote_update_roundtrip() {
        let alice = Document::new(room(), 1);
        let bob = Document::new(room(), 2);

        let update = alice.apply_local_change("hi").unwrap().unwrap();
        let bytes = update.encode().unwrap();

        assert_eq!(bob.apply_remote_update(&bytes).unwrap(), 2);
        assert_eq!(bob.text(), "hi");

        // Duplicate delivery after a resync changes nothing
        assert_eq!(bob.apply_remote_update(&bytes).unwrap(), 0);
        assert_eq!(bob.text(), "hi");
    }

    #[test]
    fn test_echo_of_local_change() {
        let doc = Document::new(room(), 1);
        let update = doc.apply_local_change("echo").unwrap().unwrap();

        assert_eq!(doc.apply_remote_update(&update.encode().unwrap()).unwrap(), 0);
        assert_eq!(doc.text(), "echo");
    }

    #[test]
    fn test_state_snapshot_for_late_joiner() {
        let alice = Document::new(room(), 1);
        alice.apply_local_change("hi").unwrap();

        let late = Document::new(room(), 2);
        late.apply_remote_update(&alice.encode_state().unwrap()).unwrap();
        assert_eq!(late.text(), "hi");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = Document::new(room(), 1);
        doc.apply_local_change("keep").unwrap();

        assert!(matches!(
            doc.apply_remote_update(b"not msgpack at all"),
            Err(Error::MalformedUpdate(_))
        ));
        assert_eq!(doc.text(), "keep");
    }

    #[test]
    fn test_authored_update_only_has_own_ops() {
        let alice = Document::new(room(), 1);
        let bob = Document::new(room(), 2);

        let from_alice = alice.apply_local_change("a").unwrap().unwrap();
        bob.apply_update(&from_alice).unwrap();
        bob.apply_local_change("ab").unwrap();

        let authored = bob.authored_update();
        assert_eq!(authored.len(), 1);
        assert!(authored.ops.iter().all(|op| op.id().replica == 2));
    }
}
