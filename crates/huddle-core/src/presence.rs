//! Presence / awareness tracking
//!
//! The tracker holds the roster of remote participants as seen by one
//! client. Every entry is keyed by the participant id carried on the wire,
//! so cursor data is always attributed to the id that sent it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default time after which a silent participant is dropped
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

const PALETTE: [&str; 8] = [
    "#e06c75", "#98c379", "#e5c07b", "#61afef", "#c678dd", "#56b6c2", "#d19a66", "#be5046",
];

/// Cursor location in the editor, zero-based
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub muted: bool,
    pub video_off: bool,
}

/// One member of a room as broadcast in awareness messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_state: Option<MediaState>,
}

impl Participant {
    /// Participant with a color derived from its id
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let id = id.into();
        let color = color_for(&id).to_string();
        Self {
            id,
            display_name: display_name.into(),
            color,
            cursor: None,
            media_state: None,
        }
    }
}

/// Stable color for a participant id
pub fn color_for(id: &str) -> &'static str {
    // FNV-1a, stable across processes and platforms
    let hash = id.bytes().fold(0xcbf29ce484222325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x100000001b3)
    });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

#[derive(Debug, Clone)]
struct Entry {
    participant: Participant,
    last_seen: Instant,
}

/// Roster of remote participants plus the local participant's own state
#[derive(Debug)]
pub struct PresenceTracker {
    local: Participant,
    participants: HashMap<String, Entry>,
    /// Recently departed ids; their late cursors are dropped until they
    /// join again or the timeout passes
    departed: HashMap<String, Instant>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local: Participant, timeout: Duration) -> Self {
        Self {
            local,
            participants: HashMap::new(),
            departed: HashMap::new(),
            timeout,
        }
    }

    /// The local participant as it is broadcast to others
    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the roster with a full awareness broadcast
    pub fn on_presence(&mut self, users: Vec<Participant>, now: Instant) {
        self.participants = users
            .into_iter()
            .filter(|p| p.id != self.local.id)
            .map(|participant| {
                (
                    participant.id.clone(),
                    Entry {
                        participant,
                        last_seen: now,
                    },
                )
            })
            .collect();
        let participants = &self.participants;
        self.departed.retain(|id, _| !participants.contains_key(id));
        debug!(count = self.participants.len(), "Roster replaced");
    }

    /// Add one participant. Returns `false` if it was already known.
    pub fn on_join(&mut self, id: &str, display_name: &str, now: Instant) -> bool {
        if id == self.local.id {
            return false;
        }
        self.departed.remove(id);

        if let Some(entry) = self.participants.get_mut(id) {
            // Fill in what a cursor-created entry did not know yet
            entry.participant.display_name = display_name.to_string();
            entry.last_seen = now;
            return false;
        }

        self.participants.insert(
            id.to_string(),
            Entry {
                participant: Participant::new(id, display_name),
                last_seen: now,
            },
        );
        debug!(participant = %id, "Participant joined");
        true
    }

    /// Remove one participant. Unknown ids are ignored.
    pub fn on_leave(&mut self, id: &str, now: Instant) -> bool {
        let removed = self.participants.remove(id).is_some();
        if removed {
            self.departed.insert(id.to_string(), now);
            debug!(participant = %id, "Participant left");
        }
        removed
    }

    fn has_departed(&self, id: &str) -> bool {
        if self.departed.contains_key(id) {
            debug!(participant = %id, "Ignoring presence from a departed participant");
            return true;
        }
        false
    }

    /// Record a cursor move. Creates a minimal entry for unknown senders.
    ///
    /// Returns `false` when the update claims the local participant's id or
    /// comes from a participant that already left.
    pub fn on_cursor(
        &mut self,
        id: &str,
        position: CursorPosition,
        color: Option<&str>,
        display_name: Option<&str>,
        now: Instant,
    ) -> bool {
        if id == self.local.id {
            warn!(participant = %id, "Ignoring remote cursor for the local participant");
            return false;
        }
        if self.has_departed(id) {
            return false;
        }

        let entry = self.participants.entry(id.to_string()).or_insert_with(|| Entry {
            participant: Participant::new(id, display_name.unwrap_or(id)),
            last_seen: now,
        });

        entry.participant.cursor = Some(position);
        if let Some(color) = color {
            entry.participant.color = color.to_string();
        }
        if let Some(name) = display_name {
            entry.participant.display_name = name.to_string();
        }
        entry.last_seen = now;
        true
    }

    /// Merge an entry a participant announced about itself. A missing
    /// cursor keeps the last known one.
    pub fn upsert(&mut self, mut participant: Participant, now: Instant) -> bool {
        if participant.id == self.local.id || self.has_departed(&participant.id) {
            return false;
        }

        if let Some(entry) = self.participants.get_mut(&participant.id) {
            if participant.cursor.is_none() {
                participant.cursor = entry.participant.cursor;
            }
            entry.participant = participant;
            entry.last_seen = now;
            return true;
        }

        debug!(participant = %participant.id, "Participant announced itself");
        self.participants.insert(
            participant.id.clone(),
            Entry {
                participant,
                last_seen: now,
            },
        );
        true
    }

    /// Record that a participant is still alive
    pub fn touch(&mut self, id: &str, now: Instant) {
        if let Some(entry) = self.participants.get_mut(id) {
            entry.last_seen = now;
        }
    }

    /// Update the local cursor. Returns `false` if it did not move.
    pub fn set_local_cursor(&mut self, position: CursorPosition) -> bool {
        if self.local.cursor == Some(position) {
            return false;
        }
        self.local.cursor = Some(position);
        true
    }

    pub fn set_local_media(&mut self, state: MediaState) {
        self.local.media_state = Some(state);
    }

    /// Drop participants silent for longer than the timeout
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .participants
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.participants.remove(id);
            debug!(participant = %id, "Participant timed out");
        }
        self.departed
            .retain(|_, left| now.saturating_duration_since(*left) <= timeout);

        expired
    }

    /// Remote participants ordered by id
    pub fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .participants
            .values()
            .map(|e| e.participant.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id).map(|e| &e.participant)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
