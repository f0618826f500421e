//! JSON text frame codec

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;
use serde_json::error::Category;
use tracing::trace;

/// Maximum frame size (64MB). Updates travel as JSON number arrays, so a
/// frame is several times larger than the encoded update it carries.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encodes and decodes relay frames
#[derive(Debug, Clone)]
pub struct Codec {
    max_message_size: usize,
}

impl Codec {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Parse one text frame
    pub fn decode(&self, text: &str) -> ProtocolResult<Message> {
        if text.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: self.max_message_size,
            });
        }

        let message: Message = serde_json::from_str(text).map_err(|e| match e.classify() {
            Category::Data => ProtocolError::Malformed(e.to_string()),
            _ => ProtocolError::InvalidJson(e.to_string()),
        })?;

        trace!(kind = %message.kind(), "Decoded message");
        Ok(message)
    }

    /// Serialize one message into a text frame
    pub fn encode(&self, message: &Message) -> ProtocolResult<String> {
        let text = serde_json::to_string(message)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        if text.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: self.max_message_size,
            });
        }

        Ok(text)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    #[test]
    fn test_decode_known_message() {
        let codec = Codec::new();
        let msg = codec
            .decode(r#"{"type":"leave","userId":"u1"}"#)
            .unwrap();
        assert_eq!(msg.kind(), MessageKind::Leave);
    }

    #[test]
    fn test_invalid_json() {
        let codec = Codec::new();
        assert!(matches!(
            codec.decode("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        let codec = Codec::new();
        assert!(matches!(
            codec.decode(r#"{"type":"update","data":"abc"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(r#"{"userId":"u1"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_size_limit() {
        let codec = Codec::with_limit(16);
        let err = codec
            .decode(r#"{"type":"leave","userId":"someone-long"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { max: 16, .. }));
    }

    #[test]
    fn test_encode_decode() {
        let codec = Codec::new();
        let msg = Message::Cursor {
            user_id: "u1".into(),
            position: huddle_core::CursorPosition::new(2, 7),
            color: "#61afef".into(),
            user_name: "Ada".into(),
        };

        let text = codec.encode(&msg).unwrap();
        assert!(text.contains(r#""type":"cursor""#));
        assert_eq!(codec.decode(&text).unwrap(), msg);
    }
}
