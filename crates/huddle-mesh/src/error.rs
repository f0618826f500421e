//! Mesh error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    /// Camera/microphone/screen capture refused or unavailable
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },

    #[error("Mesh not initialized")]
    NotInitialized,

    #[error("No local media started")]
    NoLocalMedia,

    #[error("Invalid link transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The connection backend could not be set up
    #[error("Media backend error: {0}")]
    Backend(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Transport error: {0}")]
    Transport(#[from] huddle_transport::TransportError),
}

impl MeshError {
    pub fn negotiation(peer: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        MeshError::NegotiationFailed {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
