//! Relay connection handler - processes one connection's messages

use huddle_core::{ConnectionId, Envelope, Room};
use huddle_protocol::{Codec, Message, PeerEntry};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handles a single relay connection
pub struct RelayHandler {
    /// Connection id within the relay
    pub conn: ConnectionId,
    room: Arc<Room>,
    codec: Codec,
    /// Identity announced with `join`
    user_id: Option<String>,
    /// Mesh address announced with `webrtc-join-room`
    peer_id: Option<String>,
}

impl RelayHandler {
    pub fn new(conn: ConnectionId, room: Arc<Room>) -> Self {
        Self {
            conn,
            room,
            codec: Codec::new(),
            user_id: None,
            peer_id: None,
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Process one text frame and return the replies for this connection.
    /// Malformed frames are dropped.
    pub fn process(&mut self, text: &str) -> Vec<Message> {
        match self.codec.decode(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!(room = %self.room.id(), conn = self.conn, error = %e, "Dropping malformed message");
                Vec::new()
            }
        }
    }

    /// Payload to forward to this connection, if the envelope is addressed to it
    pub fn deliver(&self, envelope: &Envelope) -> Option<Arc<str>> {
        envelope
            .is_for(self.conn)
            .then(|| envelope.payload.clone())
    }

    fn handle_message(&mut self, message: Message) -> Vec<Message> {
        debug!(room = %self.room.id(), conn = self.conn, kind = %message.kind(), "Processing message");

        match message {
            Message::SyncRequest => self.handle_sync_request(),
            Message::Update { data } => {
                self.handle_update(data);
                Vec::new()
            }
            Message::Awareness { users, cursor, .. } => {
                self.handle_awareness(users, cursor);
                Vec::new()
            }
            Message::Join { user_id, user_name } => self.handle_join(user_id, user_name),
            Message::Leave { .. } => {
                self.announce_departure();
                Vec::new()
            }
            Message::Cursor {
                position,
                color,
                user_name,
                ..
            } => {
                self.handle_cursor(position, color, user_name);
                Vec::new()
            }
            Message::WebrtcJoinRoom { peer_id, user_name } => {
                self.handle_mesh_join(peer_id, user_name)
            }
            Message::WebrtcSignal {
                target_peer_id,
                signal,
                ..
            } => {
                self.handle_signal(target_peer_id, signal);
                Vec::new()
            }
            other => {
                warn!(conn = self.conn, kind = %other.kind(), "Ignoring relay-only message from client");
                Vec::new()
            }
        }
    }

    /// Replies for a connection that fell behind the room's fan-out. The
    /// skipped envelopes may have carried updates, so the full state is sent.
    pub fn on_lagged(&self, missed: u64) -> Vec<Message> {
        warn!(room = %self.room.id(), conn = self.conn, missed, "Connection lagged, resending room state");
        self.handle_sync_request()
    }

    fn handle_sync_request(&self) -> Vec<Message> {
        match self.room.document().encode_state() {
            Ok(data) => vec![Message::Sync { data }],
            Err(e) => {
                warn!(room = %self.room.id(), error = %e, "Failed to encode room state");
                Vec::new()
            }
        }
    }

    fn handle_update(&self, data: Vec<u8>) {
        match self.room.document().apply_remote_update(&data) {
            Ok(integrated) => {
                debug!(room = %self.room.id(), integrated, "Relaying update");
                self.broadcast(&Message::Update { data });
            }
            Err(e) => {
                warn!(room = %self.room.id(), conn = self.conn, error = %e, "Rejecting update");
            }
        }
    }

    fn handle_join(&mut self, user_id: String, user_name: String) -> Vec<Message> {
        if self.user_id.as_deref() == Some(user_id.as_str()) {
            return vec![Message::roster(self.room.roster(self.conn))];
        }
        if self.user_id.is_some() {
            // Same connection, new identity: the old one is gone
            self.announce_departure();
        }

        self.room.set_user(self.conn, &user_id, &user_name);
        self.user_id = Some(user_id.clone());
        info!(room = %self.room.id(), user = %user_id, "User joined");

        self.broadcast(&Message::UserJoined { user_id, user_name });
        vec![Message::roster(self.room.roster(self.conn))]
    }

    fn handle_awareness(
        &self,
        users: Option<Vec<huddle_core::Participant>>,
        cursor: Option<huddle_core::CursorPosition>,
    ) {
        let Some(user_id) = self.user_id.clone() else {
            warn!(conn = self.conn, "Awareness before join");
            return;
        };

        if let Some(cursor) = cursor {
            self.room.set_cursor(self.conn, cursor);
        }

        // Only the sender's own entry may be forwarded
        let users = users.map(|users| {
            users
                .into_iter()
                .filter(|p| p.id == user_id)
                .collect::<Vec<_>>()
        });

        self.broadcast(&Message::Awareness {
            users,
            cursor,
            user_id: Some(user_id),
        });
    }

    fn handle_cursor(&self, position: huddle_core::CursorPosition, color: String, user_name: String) {
        let Some(user_id) = self.user_id.clone() else {
            warn!(conn = self.conn, "Cursor before join");
            return;
        };

        self.room.set_cursor(self.conn, position);
        self.broadcast(&Message::Cursor {
            user_id,
            position,
            color,
            user_name,
        });
    }

    fn handle_mesh_join(&mut self, peer_id: String, user_name: String) -> Vec<Message> {
        if self.room.claim_peer(self.conn, &peer_id) {
            // Peers still linked to the old connection must drop that link
            self.broadcast(&Message::WebrtcPeerLeft {
                peer_id: peer_id.clone(),
            });
        }
        let existing = self.room.join_mesh(self.conn, &peer_id, &user_name);
        let announce = self.peer_id.as_deref() != Some(peer_id.as_str());
        self.peer_id = Some(peer_id.clone());

        if announce {
            info!(room = %self.room.id(), peer = %peer_id, existing = existing.len(), "Peer joined mesh");
            self.broadcast(&Message::WebrtcPeerJoined { peer_id, user_name });
        }

        vec![Message::WebrtcExistingPeers {
            peers: existing
                .into_iter()
                .map(|p| PeerEntry {
                    peer_id: p.peer_id,
                    user_name: p.user_name,
                })
                .collect(),
        }]
    }

    fn handle_signal(&self, target_peer_id: String, signal: serde_json::Value) {
        let Some(from_peer_id) = self.peer_id.clone() else {
            warn!(conn = self.conn, "Signal before webrtc-join-room");
            return;
        };

        let Some(target) = self.room.connection_for_peer(&target_peer_id) else {
            debug!(peer = %target_peer_id, "Signal target not in room");
            return;
        };

        let message = Message::WebrtcSignal {
            target_peer_id,
            from_peer_id,
            signal,
        };
        match self.codec.encode(&message) {
            Ok(text) => self.room.send_to(self.conn, target, Arc::from(text)),
            Err(e) => warn!(error = %e, "Failed to encode signal"),
        }
    }

    fn broadcast(&self, message: &Message) {
        match self.codec.encode(message) {
            Ok(text) => self.room.broadcast(self.conn, Arc::from(text)),
            Err(e) => warn!(kind = %message.kind(), error = %e, "Failed to encode broadcast"),
        }
    }

    /// Tell the room this connection's user and mesh peer are gone
    /// Departures are not announced for an identity that a newer connection
    /// of the same client already holds.
    fn announce_departure(&mut self) {
        if let Some(peer_id) = self.peer_id.take() {
            let moved = self
                .room
                .connection_for_peer(&peer_id)
                .map_or(false, |conn| conn != self.conn);
            if !moved {
                self.broadcast(&Message::WebrtcPeerLeft { peer_id });
            }
        }
        if let Some(user_id) = self.user_id.take() {
            if self.room.has_user_elsewhere(self.conn, &user_id) {
                debug!(room = %self.room.id(), user = %user_id, "User still connected elsewhere");
            } else {
                info!(room = %self.room.id(), user = %user_id, "User left");
                self.broadcast(&Message::UserLeft { user_id });
            }
        }
        self.room.clear_identity(self.conn);
    }

    /// Clean up when the connection closes
    pub fn cleanup(&mut self) {
        self.announce_departure();
        self.room.detach(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{CursorPosition, Document, RoomId};
    use tokio::sync::broadcast;

    fn setup() -> Arc<Room> {
        Arc::new(Room::new(RoomId::new("r1").unwrap()))
    }

    fn connect(room: &Arc<Room>, conn: ConnectionId) -> (RelayHandler, broadcast::Receiver<Envelope>) {
        let rx = room.attach(conn);
        (RelayHandler::new(conn, room.clone()), rx)
    }

    fn drain(handler: &RelayHandler, rx: &mut broadcast::Receiver<Envelope>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(env) = rx.try_recv() {
            if let Some(payload) = handler.deliver(&env) {
                out.push(serde_json::from_str(&payload).unwrap());
            }
        }
        out
    }

    fn json(message: &Message) -> String {
        serde_json::to_string(message).unwrap()
    }

    #[test]
    fn test_join_announces_and_returns_roster() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (mut b, mut brx) = connect(&room, 2);

        a.process(&json(&Message::Join {
            user_id: "ua".into(),
            user_name: "A".into(),
        }));
        assert_eq!(
            drain(&b, &mut brx),
            vec![Message::UserJoined {
                user_id: "ua".into(),
                user_name: "A".into()
            }]
        );

        let replies = b.process(&json(&Message::Join {
            user_id: "ub".into(),
            user_name: "B".into(),
        }));
        match &replies[..] {
            [Message::Awareness { users: Some(users), .. }] => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, "ua");
            }
            other => panic!("unexpected replies: {:?}", other),
        }
    }

    #[test]
    fn test_sync_request_returns_state_not_updates() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);

        let doc = Document::new(RoomId::new("r1").unwrap(), 9);
        let update = doc.apply_local_change("hi").unwrap().unwrap();
        a.process(&json(&Message::update(&update).unwrap()));

        // A client that was offline during the update
        let (mut b, mut brx) = connect(&room, 2);
        let replies = b.process(&json(&Message::SyncRequest));
        assert!(drain(&b, &mut brx).is_empty());

        let [Message::Sync { data }] = &replies[..] else {
            panic!("expected sync, got {:?}", replies);
        };
        let late = Document::new(RoomId::new("r1").unwrap(), 3);
        late.apply_remote_update(data).unwrap();
        assert_eq!(late.text(), "hi");
    }

    #[test]
    fn test_bad_update_not_forwarded() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (b, mut brx) = connect(&room, 2);

        a.process(&json(&Message::Update { data: vec![0xc1] }));
        assert!(drain(&b, &mut brx).is_empty());
    }

    #[test]
    fn test_cursor_stamped_with_sender() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (b, mut brx) = connect(&room, 2);

        a.process(&json(&Message::Join {
            user_id: "ua".into(),
            user_name: "A".into(),
        }));
        drain(&b, &mut brx);

        a.process(&json(&Message::Cursor {
            user_id: "spoofed".into(),
            position: CursorPosition::new(5, 3),
            color: "#fff".into(),
            user_name: "A".into(),
        }));

        match &drain(&b, &mut brx)[..] {
            [Message::Cursor { user_id, position, .. }] => {
                assert_eq!(user_id, "ua");
                assert_eq!(*position, CursorPosition::new(5, 3));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cursor_before_join_dropped() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (b, mut brx) = connect(&room, 2);

        a.process(r#"{"type":"awareness","cursor":{"line":1,"column":1}}"#);
        assert!(drain(&b, &mut brx).is_empty());
    }

    #[test]
    fn test_mesh_join_lists_existing_only_to_newcomer() {
        let room = setup();
        let (mut a, mut arx) = connect(&room, 1);
        let (mut b, mut brx) = connect(&room, 2);
        let (mut c, mut crx) = connect(&room, 3);

        a.process(r#"{"type":"webrtc-join-room","peerId":"pa","userName":"A"}"#);
        b.process(r#"{"type":"webrtc-join-room","peerId":"pb","userName":"B"}"#);
        drain(&a, &mut arx);
        drain(&c, &mut crx);

        let replies = c.process(r#"{"type":"webrtc-join-room","peerId":"pc","userName":"C"}"#);
        let [Message::WebrtcExistingPeers { peers }] = &replies[..] else {
            panic!("expected roster, got {:?}", replies);
        };
        let ids: Vec<&str> = peers.iter().map(|p| p.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["pa", "pb"]);

        let joined = Message::WebrtcPeerJoined {
            peer_id: "pc".into(),
            user_name: "C".into(),
        };
        assert_eq!(drain(&a, &mut arx), vec![joined.clone()]);
        assert!(drain(&b, &mut brx).contains(&joined));
        assert!(drain(&c, &mut crx).is_empty());
    }

    #[test]
    fn test_signal_routed_to_target_only() {
        let room = setup();
        let (mut a, mut arx) = connect(&room, 1);
        let (mut b, mut brx) = connect(&room, 2);
        let (mut c, mut crx) = connect(&room, 3);

        a.process(r#"{"type":"webrtc-join-room","peerId":"pa"}"#);
        b.process(r#"{"type":"webrtc-join-room","peerId":"pb"}"#);
        c.process(r#"{"type":"webrtc-join-room","peerId":"pc"}"#);
        drain(&a, &mut arx);
        drain(&b, &mut brx);
        drain(&c, &mut crx);

        c.process(
            r#"{"type":"webrtc-signal","targetPeerId":"pa","fromPeerId":"forged","signal":{"sdp":"x"}}"#,
        );

        match &drain(&a, &mut arx)[..] {
            [Message::WebrtcSignal { from_peer_id, signal, .. }] => {
                assert_eq!(from_peer_id, "pc");
                assert_eq!(signal["sdp"], "x");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(drain(&b, &mut brx).is_empty());
    }

    #[test]
    fn test_cleanup_announces_departure_once() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (b, mut brx) = connect(&room, 2);

        a.process(r#"{"type":"join","userId":"ua","userName":"A"}"#);
        a.process(r#"{"type":"webrtc-join-room","peerId":"pa"}"#);
        drain(&b, &mut brx);

        a.process(r#"{"type":"leave","userId":"ua"}"#);
        a.cleanup();

        let left = drain(&b, &mut brx);
        assert_eq!(
            left,
            vec![
                Message::WebrtcPeerLeft { peer_id: "pa".into() },
                Message::UserLeft { user_id: "ua".into() },
            ]
        );
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_rejoin_with_new_identity_announces_departure() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (b, mut brx) = connect(&room, 2);

        a.process(r#"{"type":"join","userId":"ua","userName":"A"}"#);
        drain(&b, &mut brx);

        a.process(r#"{"type":"join","userId":"ua2","userName":"A"}"#);
        assert_eq!(
            drain(&b, &mut brx),
            vec![
                Message::UserLeft { user_id: "ua".into() },
                Message::UserJoined {
                    user_id: "ua2".into(),
                    user_name: "A".into()
                },
            ]
        );
        assert_eq!(room.user_id(1).as_deref(), Some("ua2"));
    }

    #[test]
    fn test_reconnect_before_old_socket_closes() {
        let room = setup();
        let (mut a, mut arx) = connect(&room, 1);
        let (mut old_b, _old_rx) = connect(&room, 2);

        a.process(r#"{"type":"join","userId":"ua","userName":"A"}"#);
        a.process(r#"{"type":"webrtc-join-room","peerId":"pa","userName":"A"}"#);
        old_b.process(r#"{"type":"join","userId":"ub","userName":"B"}"#);
        old_b.process(r#"{"type":"webrtc-join-room","peerId":"pb","userName":"B"}"#);
        drain(&a, &mut arx);

        // The client comes back on a new connection while the old one lingers
        let (mut new_b, _new_rx) = connect(&room, 3);
        new_b.process(r#"{"type":"join","userId":"ub","userName":"B"}"#);
        let replies = new_b.process(r#"{"type":"webrtc-join-room","peerId":"pb","userName":"B"}"#);
        let [Message::WebrtcExistingPeers { peers }] = &replies[..] else {
            panic!("expected roster, got {:?}", replies);
        };
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "pa");

        let seen = drain(&a, &mut arx);
        let left = seen
            .iter()
            .position(|m| *m == Message::WebrtcPeerLeft { peer_id: "pb".into() })
            .unwrap();
        let joined = seen
            .iter()
            .position(|m| matches!(m, Message::WebrtcPeerJoined { peer_id, .. } if peer_id == "pb"))
            .unwrap();
        assert!(left < joined);
        assert_eq!(room.connection_for_peer("pb"), Some(3));

        // The stale socket finally closes without tearing down the new one
        old_b.cleanup();
        assert!(drain(&a, &mut arx).is_empty());
        assert_eq!(room.connection_for_peer("pb"), Some(3));
    }

    #[test]
    fn test_lagged_connection_gets_full_state() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        let (b, mut brx) = connect(&room, 2);

        let doc = Document::new(RoomId::new("r1").unwrap(), 9);
        let mut text = String::new();
        for _ in 0..huddle_core::ROOM_CHANNEL_CAPACITY + 8 {
            text.push('x');
            let update = doc.apply_local_change(&text).unwrap().unwrap();
            a.process(&json(&Message::update(&update).unwrap()));
        }

        let missed = match brx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => n,
            other => panic!("expected lag, got {:?}", other.map(|e| e.from)),
        };

        let replies = b.on_lagged(missed);
        let [Message::Sync { data }] = &replies[..] else {
            panic!("expected sync, got {:?}", replies);
        };
        let replica = Document::new(RoomId::new("r1").unwrap(), 3);
        replica.apply_remote_update(data).unwrap();
        assert_eq!(replica.text(), text);
    }

    #[test]
    fn test_malformed_frame_produces_nothing() {
        let room = setup();
        let (mut a, _arx) = connect(&room, 1);
        assert!(a.process("{{{{").is_empty());
        assert!(a.process(r#"{"type":"user-joined","userId":"x"}"#).is_empty());
    }
}
