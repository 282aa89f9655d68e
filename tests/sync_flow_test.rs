//! End-to-end synchronization tests over the in-memory transport.
//!
//! Covers:
//! - Reconnect with backoff after a dropped link, presence re-announced
//! - Permanent failure once reconnect attempts are exhausted
//! - Two clients converging through a relayed server
//! - Presence propagation and display-name resolution between clients
//! - Snapshot persistence across a session restart

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout, Instant};

use tally_sync_core::transport::{MemoryHarness, MemoryLinkHandle, MemoryTransport};
use tally_sync_core::{
    ConnectionState, Envelope, Expense, FileSnapshotStore, Group, GroupMember, GroupRepository,
    MemberRole, MessageType, PresenceStatus, Result, SyncConfig, SyncError, SyncSession,
    UserIdentity,
};

// =============================================================================
// Fixtures
// =============================================================================

struct StaticGroups {
    groups: Vec<Group>,
}

#[async_trait]
impl GroupRepository for StaticGroups {
    async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        Ok(self.groups.iter().find(|g| g.id == id).cloned())
    }

    async fn list_groups_for_user(&self, user_id: &str) -> Result<Vec<Group>> {
        Ok(self
            .groups
            .iter()
            .filter(|g| g.member(user_id).is_some())
            .cloned()
            .collect())
    }
}

fn trip_group() -> Group {
    Group::new("grp-1", "Ski trip", 100.0)
        .with_member(GroupMember::new("admin-1", MemberRole::Admin).with_display_name("Asha"))
        .with_member(GroupMember::new("mgr-1", MemberRole::Manager).with_display_name("Mo"))
        .with_member(GroupMember::new("user-1", MemberRole::Member).with_display_name("Uri"))
        .with_member(GroupMember::new("user-2", MemberRole::Member))
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.connection.connect_timeout = Duration::from_millis(500);
    config.connection.heartbeat_interval = Duration::from_millis(500);
    config.connection.reconnect_base_delay = Duration::from_millis(10);
    config.connection.max_reconnect_attempts = 3;
    config.presence.eviction_interval = Duration::from_millis(50);
    config
}

fn session_for(user_id: &str, transport: MemoryTransport) -> SyncSession {
    SyncSession::new(
        UserIdentity::new(user_id, "Tester", MemberRole::Member),
        config(),
        Arc::new(transport),
        Arc::new(StaticGroups {
            groups: vec![trip_group()],
        }),
    )
}

async fn started(user_id: &str) -> (SyncSession, MemoryLinkHandle, MemoryHarness) {
    let (transport, mut harness) = MemoryTransport::new();
    let session = session_for(user_id, transport);
    session.start().await.expect("session should start");
    let link = timeout(Duration::from_secs(2), harness.next_link())
        .await
        .expect("no connection within 2s")
        .expect("harness closed");
    (session, link, harness)
}

/// Play server: everything either client sends is fanned out to both,
/// the sender included, exactly like the real broadcast server.
async fn relay(mut a: MemoryLinkHandle, mut b: MemoryLinkHandle) {
    loop {
        tokio::select! {
            frame = a.next_outbound() => match frame {
                Some(text) => {
                    a.deliver_text(text.clone());
                    b.deliver_text(text);
                }
                None => break,
            },
            frame = b.next_outbound() => match frame {
                Some(text) => {
                    b.deliver_text(text.clone());
                    a.deliver_text(text);
                }
                None => break,
            },
        }
    }
}

async fn next_of(link: &mut MemoryLinkHandle, kind: MessageType) -> Envelope {
    loop {
        let frame = timeout(Duration::from_secs(2), link.next_outbound())
            .await
            .expect("timed out waiting for frame")
            .expect("link closed");
        let envelope = Envelope::decode(&frame).unwrap();
        if envelope.kind == kind {
            return envelope;
        }
    }
}

// =============================================================================
// Connection Lifecycle
// =============================================================================

#[tokio::test]
async fn test_reconnect_after_drop_reannounces_presence() {
    let (session, link, mut harness) = started("user-1").await;
    assert_eq!(session.connection_state().await, ConnectionState::Connected);
    assert_eq!(harness.connect_attempts(), 1);

    link.drop_link();

    // The manager should come back on its own with a fresh link
    let mut link = timeout(Duration::from_secs(2), harness.next_link())
        .await
        .expect("no reconnect within 2s")
        .expect("harness closed");

    let deadline = Instant::now() + Duration::from_secs(2);
    while session.connection_state().await != ConnectionState::Connected {
        assert!(Instant::now() < deadline, "never reconnected");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.connect_attempts(), 2);
    assert!(session.stats().await.reconnects >= 1);

    // Collaborators evicted us while we were gone; presence goes out again
    let envelope = next_of(&mut link, MessageType::PresenceUpdate).await;
    assert_eq!(envelope.user_id, "user-1");

    session.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_attempts_leave_connection_failed() {
    let (transport, harness) = MemoryTransport::new();
    harness.refuse_next(10);
    let session = session_for("user-1", transport);

    let result = session.start().await;
    assert!(matches!(result, Err(SyncError::Connection(_))));
    assert_eq!(session.connection_state().await, ConnectionState::Failed);
    // Exactly max_reconnect_attempts establish attempts, then it gives up
    assert_eq!(harness.connect_attempts(), 3);
}

#[tokio::test]
async fn test_offline_changes_stay_local() {
    let (transport, harness) = MemoryTransport::new();
    harness.refuse_next(10);
    let session = session_for("user-1", transport);
    assert!(session.start().await.is_err());

    // The session never came online, but optimistic writes still apply
    let expense = session
        .add_expense(Expense::new("Fuel", 35.0, "user-1").with_group("grp-1"))
        .await
        .unwrap();
    assert!(session.expense(&expense.id).await.is_some());
    assert_eq!(session.recent_activity(Some("grp-1")).await.len(), 1);
}

// =============================================================================
// Two-Client Reconciliation
// =============================================================================

#[tokio::test]
async fn test_two_clients_converge_on_expenses() {
    let (session_a, link_a, _harness_a) = started("user-1").await;
    let (session_b, link_b, _harness_b) = started("user-2").await;
    tokio::spawn(relay(link_a, link_b));

    let expense = session_a
        .add_expense(Expense::new("Cabin rental", 80.0, "user-1").with_group("grp-1"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while session_b.expense(&expense.id).await.is_none() {
        assert!(Instant::now() < deadline, "expense never reached client B");
        sleep(Duration::from_millis(10)).await;
    }
    let mut seen = session_b.expense(&expense.id).await.unwrap();
    assert_eq!(seen.amount, 80.0);
    assert_eq!(seen.paid_by, "user-1");

    // B corrects the amount; A should converge to it
    seen.amount = 95.0;
    session_b.update_expense(seen).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let current = session_a.expense(&expense.id).await.unwrap();
        if current.amount == 95.0 {
            break;
        }
        assert!(Instant::now() < deadline, "update never reached client A");
        sleep(Duration::from_millis(10)).await;
    }

    // Both feeds settle on the same two entries
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let feed_a = session_a.recent_activity(Some("grp-1")).await;
        let feed_b = session_b.recent_activity(Some("grp-1")).await;
        if feed_a.len() == 2 && feed_b.len() == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "feeds never converged");
        sleep(Duration::from_millis(10)).await;
    }

    // The relay echoes the sender's own events back; they must be dropped
    assert!(session_a.reconcile_counts().await.self_echoes >= 1);
    assert_eq!(session_a.reconcile_counts().await.malformed, 0);

    session_a.shutdown().await;
    session_b.shutdown().await;
}

#[tokio::test]
async fn test_delete_tombstone_wins_over_stale_update() {
    let (session_a, link_a, _harness_a) = started("user-1").await;
    let (session_b, link_b, _harness_b) = started("user-2").await;
    tokio::spawn(relay(link_a, link_b));

    let expense = session_a
        .add_expense(Expense::new("Snacks", 12.0, "user-1").with_group("grp-1"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while session_b.expense(&expense.id).await.is_none() {
        assert!(Instant::now() < deadline, "expense never reached client B");
        sleep(Duration::from_millis(10)).await;
    }

    session_a.delete_expense(&expense.id).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while session_b.expense(&expense.id).await.is_some() {
        assert!(Instant::now() < deadline, "delete never reached client B");
        sleep(Duration::from_millis(10)).await;
    }

    // Deleted on both sides, activity shows the deletion
    assert!(session_a.expense(&expense.id).await.is_none());
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let feed = session_b.recent_activity(Some("grp-1")).await;
        if feed
            .iter()
            .any(|e| e.kind == tally_sync_core::ActivityKind::ExpenseDeleted)
        {
            break;
        }
        assert!(Instant::now() < deadline, "deletion never hit B's feed");
        sleep(Duration::from_millis(10)).await;
    }

    session_a.shutdown().await;
    session_b.shutdown().await;
}

// =============================================================================
// Presence Between Clients
// =============================================================================

#[tokio::test]
async fn test_presence_propagates_with_display_names() {
    let (session_a, link_a, _harness_a) = started("user-1").await;
    let (session_b, link_b, _harness_b) = started("user-2").await;
    tokio::spawn(relay(link_a, link_b));

    session_a
        .set_presence(
            PresenceStatus::Editing,
            Some("grp-1".to_string()),
            Some("exp-42".to_string()),
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let online = session_b.online_users(Some("grp-1")).await;
        if !online.is_empty() {
            assert_eq!(online.len(), 1);
            assert_eq!(online[0].user_id, "user-1");
            // Resolved from B's own group membership
            assert_eq!(online[0].display_name, "Uri");
            assert_eq!(online[0].status, PresenceStatus::Editing);
            assert_eq!(online[0].editing_entity_id.as_deref(), Some("exp-42"));
            break;
        }
        assert!(Instant::now() < deadline, "presence never reached client B");
        sleep(Duration::from_millis(10)).await;
    }

    // A's own record never shows up in A's listing, echoes included
    assert!(session_a.online_users(Some("grp-1")).await.is_empty());

    session_a.shutdown().await;
    session_b.shutdown().await;
}

// =============================================================================
// Snapshot Persistence
// =============================================================================

#[tokio::test]
async fn test_snapshot_restores_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSnapshotStore::new(dir.path().join("state.json")));

    let expense_id = {
        let (transport, mut harness) = MemoryTransport::new();
        let session =
            session_for("user-1", transport).with_snapshot_store(store.clone());
        session.start().await.unwrap();
        let _link = timeout(Duration::from_secs(2), harness.next_link())
            .await
            .unwrap()
            .unwrap();

        let expense = session
            .add_expense(Expense::new("Paint", 30.0, "user-1"))
            .await
            .unwrap();
        // Shutdown writes the final snapshot
        session.shutdown().await;
        expense.id
    };

    let (transport, mut harness) = MemoryTransport::new();
    let session = session_for("user-1", transport).with_snapshot_store(store);
    session.start().await.unwrap();
    let _link = timeout(Duration::from_secs(2), harness.next_link())
        .await
        .unwrap()
        .unwrap();

    let restored = session.expense(&expense_id).await;
    assert!(restored.is_some(), "expense lost across restart");
    assert_eq!(restored.unwrap().description, "Paint");
    assert!(!session.recent_activity(None).await.is_empty());

    session.shutdown().await;
}
