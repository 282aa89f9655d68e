//! Transport capability port.
//!
//! The connection layer talks to a `Transport` and never knows whether it
//! is the production WebSocket client or the in-memory fake used by tests.

pub mod memory;
pub mod websocket;

pub use memory::{MemoryHarness, MemoryLinkHandle, MemoryTransport};
pub use websocket::WebSocketTransport;

use async_trait::async_trait;

use crate::error::Result;

/// A frame delivered by a transport link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text payload carrying one wire envelope
    Text(String),
    /// Ping/pong style traffic; counts as liveness, carries nothing
    Keepalive,
}

/// Factory for transport links. One `connect` call yields one live link.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TransportLink>>;
}

/// One established connection to the collaboration server.
#[async_trait]
pub trait TransportLink: Send {
    /// Send a text frame. Errors indicate the link is no longer usable.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next frame. `None` means the link is closed.
    async fn recv(&mut self) -> Option<Frame>;

    /// Close the link. Safe to call on an already-dead link.
    async fn close(&mut self);
}
