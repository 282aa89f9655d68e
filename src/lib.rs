//! Tally Sync Core - Real-Time Collaboration Engine
//!
//! Client-side synchronization for shared expense tracking:
//!
//! - **Connection lifecycle**: heartbeats, exponential backoff, bounded
//!   reconnect attempts
//! - **Presence**: who is online and what they are editing, with
//!   staleness eviction
//! - **Optimistic mutations**: local writes apply immediately and
//!   reconcile last-writer-wins when remote copies arrive
//! - **Activity feed**: bounded, newest-first log of group activity
//! - **Approvals**: threshold-gated expense approval with role checks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       SyncSession                        │
//! │                                                          │
//! │  ┌──────────┐ ┌───────────┐ ┌──────────┐ ┌───────────┐  │
//! │  │ Presence │ │Reconciler │ │ Activity │ │ Approvals │  │
//! │  └──────────┘ └───────────┘ └──────────┘ └───────────┘  │
//! │        ▲            ▲             ▲            │        │
//! │        └────────────┴──────┬──────┴────────────┘        │
//! │                   ┌────────┴────────┐                   │
//! │                   │ConnectionManager│                   │
//! │                   └────────┬────────┘                   │
//! └────────────────────────────┼────────────────────────────┘
//!                     ┌────────┴────────┐
//!                     │    Transport    │  websocket / in-memory
//!                     └─────────────────┘
//! ```
//!
//! Applications construct a [`SyncSession`] with their identity, a
//! transport and a [`GroupRepository`], call [`SyncSession::start`], and
//! then use the session facade for everything else.

pub mod activity;
pub mod approval;
pub mod config;
pub mod connection;
pub mod error;
pub mod groups;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod types;

pub use approval::ApprovalDecision;
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Result, SyncError};
pub use groups::GroupRepository;
pub use protocol::{Envelope, MessageType, PresencePayload};
pub use session::{SessionStats, SyncSession};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, SyncSnapshot};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};
pub use types::*;
