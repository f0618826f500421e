//! Error types for Huddle Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Update exceeds limit: {size} > {limit}")]
    UpdateTooLarge { size: usize, limit: usize },

    /// Raised only when the operation log contradicts itself (two different
    /// operations sharing one id). A correct replica never produces this.
    #[error("Unresolvable merge conflict: {0}")]
    MergeConflict(String),
}

/// Result type alias for Huddle Core operations
pub type Result<T> = std::result::Result<T, Error>;
