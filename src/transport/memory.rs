//! In-memory transport for tests.
//!
//! `MemoryTransport` satisfies the `Transport` port; the paired
//! `MemoryHarness` plays the server side: it hands out one
//! [`MemoryLinkHandle`] per accepted connection, through which a test can
//! deliver frames, observe outbound traffic, and drop the link to force a
//! reconnect. Connection attempts can be refused to exercise backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Frame, Transport, TransportLink};
use crate::error::{Result, SyncError};

struct MemoryShared {
    refuse: AtomicU32,
    connects: AtomicU32,
    link_tx: mpsc::UnboundedSender<MemoryLinkHandle>,
}

/// Channel-backed transport fake.
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
}

impl MemoryTransport {
    /// Create a transport and the harness controlling its server side.
    pub fn new() -> (Self, MemoryHarness) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MemoryShared {
            refuse: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            link_tx,
        });
        (
            Self {
                shared: shared.clone(),
            },
            MemoryHarness {
                shared,
                links: link_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Box<dyn TransportLink>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        let refuse = self.shared.refuse.load(Ordering::SeqCst);
        if refuse > 0 {
            self.shared.refuse.store(refuse - 1, Ordering::SeqCst);
            return Err(SyncError::Connection("connection refused".to_string()));
        }

        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();

        let handle = MemoryLinkHandle {
            to_client: to_client_tx,
            from_client: from_client_rx,
        };
        // Harness gone means nobody is watching; the link still works.
        let _ = self.shared.link_tx.send(handle);

        Ok(Box::new(MemoryLink {
            inbound: to_client_rx,
            outbound: from_client_tx,
        }))
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| SyncError::Connection("link closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server side of one accepted connection.
pub struct MemoryLinkHandle {
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryLinkHandle {
    /// Deliver a text frame to the client.
    pub fn deliver_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Frame::Text(text.into())).is_ok()
    }

    /// Deliver a keepalive frame to the client.
    pub fn deliver_keepalive(&self) -> bool {
        self.to_client.send(Frame::Keepalive).is_ok()
    }

    /// Await the next frame sent by the client.
    pub async fn next_outbound(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Drop the link, closing the client's receive side.
    pub fn drop_link(self) {}
}

/// Test-side controller for a [`MemoryTransport`].
pub struct MemoryHarness {
    shared: Arc<MemoryShared>,
    links: mpsc::UnboundedReceiver<MemoryLinkHandle>,
}

impl MemoryHarness {
    /// Await the next accepted connection.
    pub async fn next_link(&mut self) -> Option<MemoryLinkHandle> {
        self.links.recv().await
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.shared.refuse.fetch_add(count, Ordering::SeqCst);
    }

    /// Total connection attempts seen, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (transport, mut harness) = MemoryTransport::new();

        let mut link = transport.connect().await.unwrap();
        let mut handle = harness.next_link().await.unwrap();

        handle.deliver_text("hello");
        assert_eq!(link.recv().await, Some(Frame::Text("hello".to_string())));

        link.send("world".to_string()).await.unwrap();
        assert_eq!(handle.next_outbound().await, Some("world".to_string()));
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let (transport, harness) = MemoryTransport::new();
        harness.refuse_next(2);

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(harness.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_dropped_link_closes_client() {
        let (transport, mut harness) = MemoryTransport::new();

        let mut link = transport.connect().await.unwrap();
        let handle = harness.next_link().await.unwrap();
        handle.drop_link();

        assert_eq!(link.recv().await, None);
    }
}
