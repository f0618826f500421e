//! Transport error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel is not open; the message was dropped
    #[error("Transport unavailable: channel is not open")]
    Unavailable,

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] huddle_protocol::ProtocolError),

    #[error("Core error: {0}")]
    Core(#[from] huddle_core::Error),
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        TransportError::InvalidUrl(e.to_string())
    }
}
