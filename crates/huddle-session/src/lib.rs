//! Huddle Session - a collaboration room as one owned object
//!
//! [`CollabSession`] wires the transport client, the replicated document,
//! the presence tracker and the call mesh together for one user in one
//! room. [`SessionConfig`] loads the client settings from TOML.

pub mod config;
pub mod error;
pub mod session;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use session::{CollabSession, SessionEvent};
