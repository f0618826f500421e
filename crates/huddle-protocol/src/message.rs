//! Relay protocol messages

use crate::error::{ProtocolError, ProtocolResult};
use huddle_core::{CursorPosition, Participant, Update};
use serde::{Deserialize, Serialize};

/// A mesh participant listed in `webrtc-existing-peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub peer_id: String,
    #[serde(default)]
    pub user_name: String,
}

/// Every message carried over a room channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Ask the relay for the full document state
    SyncRequest,

    /// Full document state (encoded [`Update`])
    Sync { data: Vec<u8> },

    /// Incremental document update (encoded [`Update`])
    Update { data: Vec<u8> },

    /// Roster broadcast or a cursor-only presence update.
    /// `user_id` is stamped by the relay.
    Awareness {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        users: Option<Vec<Participant>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<CursorPosition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    Join {
        user_id: String,
        #[serde(default)]
        user_name: String,
    },

    UserJoined {
        user_id: String,
        #[serde(default)]
        user_name: String,
    },

    Leave { user_id: String },

    UserLeft { user_id: String },

    Cursor {
        user_id: String,
        position: CursorPosition,
        #[serde(default)]
        color: String,
        #[serde(default)]
        user_name: String,
    },

    WebrtcJoinRoom {
        peer_id: String,
        #[serde(default)]
        user_name: String,
    },

    WebrtcExistingPeers { peers: Vec<PeerEntry> },

    WebrtcPeerJoined {
        peer_id: String,
        #[serde(default)]
        user_name: String,
    },

    WebrtcPeerLeft { peer_id: String },

    /// Opaque negotiation payload; the relay only reads `target_peer_id`
    WebrtcSignal {
        target_peer_id: String,
        from_peer_id: String,
        signal: serde_json::Value,
    },
}

impl Message {
    /// Wrap a document update for transmission
    pub fn update(update: &Update) -> ProtocolResult<Self> {
        Ok(Message::Update {
            data: update.encode()?,
        })
    }

    /// Roster broadcast
    pub fn roster(users: Vec<Participant>) -> Self {
        Message::Awareness {
            users: Some(users),
            cursor: None,
            user_id: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SyncRequest => MessageKind::SyncRequest,
            Message::Sync { .. } => MessageKind::Sync,
            Message::Update { .. } => MessageKind::Update,
            Message::Awareness { .. } => MessageKind::Awareness,
            Message::Join { .. } => MessageKind::Join,
            Message::UserJoined { .. } => MessageKind::UserJoined,
            Message::Leave { .. } => MessageKind::Leave,
            Message::UserLeft { .. } => MessageKind::UserLeft,
            Message::Cursor { .. } => MessageKind::Cursor,
            Message::WebrtcJoinRoom { .. } => MessageKind::WebrtcJoinRoom,
            Message::WebrtcExistingPeers { .. } => MessageKind::WebrtcExistingPeers,
            Message::WebrtcPeerJoined { .. } => MessageKind::WebrtcPeerJoined,
            Message::WebrtcPeerLeft { .. } => MessageKind::WebrtcPeerLeft,
            Message::WebrtcSignal { .. } => MessageKind::WebrtcSignal,
        }
    }
}

/// Message discriminator, used to subscribe to one kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    SyncRequest,
    Sync,
    Update,
    Awareness,
    Join,
    UserJoined,
    Leave,
    UserLeft,
    Cursor,
    WebrtcJoinRoom,
    WebrtcExistingPeers,
    WebrtcPeerJoined,
    WebrtcPeerLeft,
    WebrtcSignal,
}

impl MessageKind {
    pub const ALL: [MessageKind; 14] = [
        MessageKind::SyncRequest,
        MessageKind::Sync,
        MessageKind::Update,
        MessageKind::Awareness,
        MessageKind::Join,
        MessageKind::UserJoined,
        MessageKind::Leave,
        MessageKind::UserLeft,
        MessageKind::Cursor,
        MessageKind::WebrtcJoinRoom,
        MessageKind::WebrtcExistingPeers,
        MessageKind::WebrtcPeerJoined,
        MessageKind::WebrtcPeerLeft,
        MessageKind::WebrtcSignal,
    ];

    /// The wire `type` string
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SyncRequest => "sync-request",
            MessageKind::Sync => "sync",
            MessageKind::Update => "update",
            MessageKind::Awareness => "awareness",
            MessageKind::Join => "join",
            MessageKind::UserJoined => "user-joined",
            MessageKind::Leave => "leave",
            MessageKind::UserLeft => "user-left",
            MessageKind::Cursor => "cursor",
            MessageKind::WebrtcJoinRoom => "webrtc-join-room",
            MessageKind::WebrtcExistingPeers => "webrtc-existing-peers",
            MessageKind::WebrtcPeerJoined => "webrtc-peer-joined",
            MessageKind::WebrtcPeerLeft => "webrtc-peer-left",
            MessageKind::WebrtcSignal => "webrtc-signal",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_message_shape() {
        let json = serde_json::to_value(Message::SyncRequest).unwrap();
        assert_eq!(json, json!({"type": "sync-request"}));
    }

    #[test]
    fn test_join_field_names() {
        let msg = Message::Join {
            user_id: "u1".into(),
            user_name: "Ada".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({"type": "join", "userId": "u1", "userName": "Ada"}));
    }

    #[test]
    fn test_update_data_is_number_array() {
        let msg = Message::Update { data: vec![1, 2, 255] };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, json!({"type": "update", "data": [1, 2, 255]}));
    }

    #[test]
    fn test_signal_from_browser_json() {
        let text = r#"{
            "type": "webrtc-signal",
            "targetPeerId": "p2",
            "fromPeerId": "p1",
            "signal": {"type": "offer", "sdp": "v=0"}
        }"#;

        let msg: Message = serde_json::from_str(text).unwrap();
        match msg {
            Message::WebrtcSignal {
                target_peer_id,
                from_peer_id,
                signal,
            } => {
                assert_eq!(target_peer_id, "p2");
                assert_eq!(from_peer_id, "p1");
                assert_eq!(signal["sdp"], "v=0");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_existing_peers() {
        let text = r#"{"type":"webrtc-existing-peers","peers":[{"peerId":"a","userName":"A"}]}"#;
        let msg: Message = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            Message::WebrtcExistingPeers {
                peers: vec![PeerEntry {
                    peer_id: "a".into(),
                    user_name: "A".into()
                }]
            }
        );
    }

    #[test]
    fn test_awareness_cursor_only() {
        let text = r#"{"type":"awareness","cursor":{"line":5,"column":3}}"#;
        let msg: Message = serde_json::from_str(text).unwrap();
        assert_eq!(
            msg,
            Message::Awareness {
                users: None,
                cursor: Some(CursorPosition::new(5, 3)),
                user_id: None,
            }
        );
    }

    #[test]
    fn test_kind_strings_roundtrip() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("webrtc-hangup".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let msg = Message::WebrtcPeerLeft { peer_id: "p".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.kind().as_str());
    }
}
