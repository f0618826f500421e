//! Huddle Transport Layer
//!
//! Provides the network side of a collaboration room:
//! - TransportClient: one WebSocket channel per room, with reconnect backoff
//!   and typed pub/sub dispatch of incoming messages
//! - RelayServer: a reference relay that fans messages out within a room,
//!   answers sync requests and routes mesh signals

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod relay;

pub use backoff::ReconnectPolicy;
pub use client::{Connection, ConnectionState, Credential, TransportClient, TransportConfig};
pub use dispatch::{Handler, HandlerRegistry, SubscriptionId, Topic};
pub use error::TransportError;
pub use handler::RelayHandler;
pub use relay::RelayServer;
