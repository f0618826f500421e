//! Session error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Document error: {0}")]
    Document(#[from] huddle_core::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] huddle_protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] huddle_transport::TransportError),

    #[error("Mesh error: {0}")]
    Mesh(#[from] huddle_mesh::MeshError),

    #[error("Session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
