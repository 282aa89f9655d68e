//! Session orchestration.
//!
//! `SyncSession` is the one object an application holds. It wires the
//! connection manager, presence tracker, reconciler, activity log and
//! approval workflow together behind a single facade and runs the event
//! loop that feeds them from the wire.
//!
//! All mutable state lives in one `SessionState` behind a mutex, so every
//! component observes changes in a consistent order. Locks are never held
//! across a transport send.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, info, warn};

use crate::activity::ActivityLog;
use crate::approval::{ApprovalDecision, ApprovalWorkflow};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{Result, SyncError};
use crate::groups::{GroupRegistry, GroupRepository};
use crate::presence::PresenceTracker;
use crate::protocol::{Envelope, MessageType, PresencePayload};
use crate::reconcile::{MutationReconciler, ReceiveOutcome, ReconcileCounts};
use crate::snapshot::{SnapshotStore, SyncSnapshot};
use crate::transport::Transport;
use crate::types::{
    ActivityEntry, ActivityKind, ApprovalRequest, ApprovalStatus, EntityKind, Expense, Group,
    GroupMember, MemberRole, MutationEvent, MutationOp, PresenceRecord, PresenceStatus,
    UserIdentity,
};

/// Counters the session accumulates over its lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    /// Remote presence updates accepted into the tracker
    pub presence_updates: u64,
    /// Remote activity entries recorded
    pub activity_received: u64,
    /// Envelopes whose payload failed to decode
    pub malformed_payloads: u64,
    /// Times the connection came back after a drop
    pub reconnects: u64,
    pub snapshots_saved: u64,
    pub snapshot_failures: u64,
}

/// Everything mutable, behind one lock.
struct SessionState {
    registry: GroupRegistry,
    presence: PresenceTracker,
    reconciler: MutationReconciler,
    activity: ActivityLog,
    approvals: ApprovalWorkflow,
    stats: SessionStats,
}

impl SessionState {
    fn capture_snapshot(&self) -> SyncSnapshot {
        SyncSnapshot::new(
            self.reconciler.export_entities(),
            self.activity.export(),
            self.approvals.export_requests(),
        )
    }
}

/// A running collaboration session for one authenticated user.
pub struct SyncSession {
    user: UserIdentity,
    config: SyncConfig,
    connection: Arc<ConnectionManager>,
    groups: Arc<dyn GroupRepository>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    state: Arc<Mutex<SessionState>>,
    local_presence: Arc<Mutex<PresencePayload>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn new(
        user: UserIdentity,
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        groups: Arc<dyn GroupRepository>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(config.connection.clone(), transport));
        let state = SessionState {
            registry: GroupRegistry::new(),
            presence: PresenceTracker::new(&config.presence),
            reconciler: MutationReconciler::new(user.user_id.clone(), &config.reconciler),
            activity: ActivityLog::new(&config.activity),
            approvals: ApprovalWorkflow::new(),
            stats: SessionStats::default(),
        };

        Self {
            user,
            config,
            connection,
            groups,
            snapshots: None,
            state: Arc::new(Mutex::new(state)),
            local_presence: Arc::new(Mutex::new(PresencePayload {
                status: PresenceStatus::Viewing,
                scope: None,
                editing_entity_id: None,
            })),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Attach a snapshot store. Without one the session is purely
    /// in-memory.
    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Load groups and any snapshot, connect, and spawn the event loop.
    ///
    /// Group data is required; a missing or unreadable snapshot is not,
    /// the session just starts from empty state.
    pub async fn start(&self) -> Result<()> {
        if self.task.lock().await.is_some() {
            return Err(SyncError::State("session already started".into()));
        }

        {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            state
                .registry
                .load_for_user(self.groups.as_ref(), &self.user.user_id)
                .await?;

            if let Some(store) = &self.snapshots {
                match store.load().await {
                    Ok(Some(snapshot)) => {
                        info!(saved_at = %snapshot.saved_at, "Restoring snapshot");
                        state.reconciler.restore_entities(snapshot.entities);
                        state.activity.restore(snapshot.activity);
                        state.approvals.restore_requests(snapshot.approvals);
                    }
                    Ok(None) => debug!("No saved snapshot"),
                    Err(e) => warn!(error = %e, "Snapshot load failed, starting empty"),
                }
            }
        }

        self.connection
            .connect(self.user.user_id.as_str(), None)
            .await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session_loop = SessionLoop {
            user_id: self.user.user_id.clone(),
            state: self.state.clone(),
            connection: self.connection.clone(),
            snapshots: self.snapshots.clone(),
            local_presence: self.local_presence.clone(),
            eviction_interval: self.config.presence.eviction_interval,
            autosave_interval: self.config.snapshot.autosave_interval,
            shutdown_rx,
        };
        *self.task.lock().await = Some(tokio::spawn(session_loop.run()));
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let payload = self.local_presence.lock().await.clone();
        self.announce_presence(&payload).await;

        info!(user_id = %self.user.user_id, "Session started");
        Ok(())
    }

    /// Stop the loop, take a final snapshot and close the connection.
    pub async fn shutdown(&self) {
        let shutdown = self.shutdown_tx.lock().await.take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(e) = self.save_snapshot().await {
            warn!(error = %e, "Final snapshot failed");
        }
        self.connection.disconnect().await;
        info!(user_id = %self.user.user_id, "Session shut down");
    }

    /// Update and announce this user's presence. Offline the update is
    /// kept locally and announced on the next reconnect.
    pub async fn set_presence(
        &self,
        status: PresenceStatus,
        scope: Option<String>,
        editing_entity_id: Option<String>,
    ) -> Result<()> {
        let payload = PresencePayload {
            status,
            scope,
            editing_entity_id,
        };
        *self.local_presence.lock().await = payload.clone();
        let envelope = Envelope::presence_update(self.user.user_id.as_str(), &payload)?;
        match self.connection.send(envelope).await {
            Ok(()) => Ok(()),
            Err(SyncError::NotConnected) => {
                debug!("Offline, presence will be announced on reconnect");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Collaborators currently online in the given scope, this user
    /// excluded. Stale records are evicted before the query.
    pub async fn online_users(&self, scope: Option<&str>) -> Vec<PresenceRecord> {
        let mut state = self.state.lock().await;
        state.presence.evict_stale(Utc::now());
        state.presence.online(&self.user.user_id, scope)
    }

    /// Create an expense, submitting it for approval when the group's
    /// threshold requires it. Applied locally at once; the broadcast is
    /// best-effort.
    pub async fn add_expense(&self, expense: Expense) -> Result<Expense> {
        validate_expense(&expense)?;
        let mut expense = expense;

        let (event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;

            if let Some(group_id) = expense.group_id.clone() {
                let group = state
                    .registry
                    .group(&group_id)
                    .ok_or_else(|| SyncError::State(format!("unknown group: {}", group_id)))?
                    .clone();
                if state
                    .registry
                    .active_role(&group_id, &self.user.user_id)
                    .is_none()
                {
                    return Err(SyncError::Authorization(format!(
                        "{} is not an active member of {}",
                        self.user.user_id, group_id
                    )));
                }
                let request = state.approvals.submit(&expense, &group)?;
                expense.approval_status = request.map(|r| r.status);
            }

            let data = serde_json::to_value(&expense)?;
            let event = state.reconciler.apply_local(
                MutationOp::Create,
                EntityKind::Expense,
                expense.id.clone(),
                data,
                expense.group_id.clone(),
            );
            let entry = ActivityEntry::from_mutation(&event);
            state.activity.record(entry.clone());
            (event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(expense)
    }

    /// Replace an existing expense's fields.
    ///
    /// An update that pushes an unapproved expense over its group's
    /// threshold submits it for approval the same way a create does. The
    /// workflow owns the approval status; an update cannot move it.
    pub async fn update_expense(&self, expense: Expense) -> Result<Expense> {
        validate_expense(&expense)?;
        let mut expense = expense;

        let (event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            if state.reconciler.entity(&expense.id).is_none() {
                return Err(SyncError::State(format!("unknown expense: {}", expense.id)));
            }

            if let Some(group_id) = expense.group_id.clone() {
                let group = state
                    .registry
                    .group(&group_id)
                    .ok_or_else(|| SyncError::State(format!("unknown group: {}", group_id)))?
                    .clone();
                if state
                    .registry
                    .active_role(&group_id, &self.user.user_id)
                    .is_none()
                {
                    return Err(SyncError::Authorization(format!(
                        "{} is not an active member of {}",
                        self.user.user_id, group_id
                    )));
                }
                match state.approvals.request(&expense.id) {
                    Some(request) => expense.approval_status = Some(request.status),
                    None => {
                        let request = state.approvals.submit(&expense, &group)?;
                        expense.approval_status = request.map(|r| r.status);
                    }
                }
            }

            let data = serde_json::to_value(&expense)?;
            let event = state.reconciler.apply_local(
                MutationOp::Update,
                EntityKind::Expense,
                expense.id.clone(),
                data,
                expense.group_id.clone(),
            );
            let entry = ActivityEntry::from_mutation(&event);
            state.activity.record(entry.clone());
            (event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(expense)
    }

    /// Delete an expense, leaving a tombstone so stale updates cannot
    /// resurrect it.
    pub async fn delete_expense(&self, expense_id: &str) -> Result<MutationEvent> {
        let (event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let data = state
                .reconciler
                .entity(expense_id)
                .cloned()
                .ok_or_else(|| SyncError::State(format!("unknown expense: {}", expense_id)))?;
            let group_id = data
                .get("groupId")
                .and_then(|v| v.as_str())
                .map(String::from);
            let event = state.reconciler.apply_local(
                MutationOp::Delete,
                EntityKind::Expense,
                expense_id,
                serde_json::json!({}),
                group_id,
            );
            let entry = ActivityEntry::from_mutation(&event);
            state.activity.record(entry.clone());
            (event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(event)
    }

    /// Approve or reject a pending expense as this user.
    ///
    /// The decision is applied to the expense entity, logged to the
    /// activity feed and broadcast like any other mutation.
    pub async fn decide_approval(
        &self,
        expense_id: &str,
        decision: ApprovalDecision,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest> {
        let (decided, event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;

            let request = state
                .approvals
                .request(expense_id)
                .cloned()
                .ok_or_else(|| {
                    SyncError::State(format!("no approval request for expense {}", expense_id))
                })?;
            let group_id = request.group_id.clone().ok_or_else(|| {
                SyncError::State(format!("approval request {} has no group", expense_id))
            })?;
            let role = state
                .registry
                .active_role(&group_id, &self.user.user_id)
                .ok_or_else(|| {
                    SyncError::Authorization(format!(
                        "{} is not an active member of {}",
                        self.user.user_id, group_id
                    ))
                })?;

            let decided = state.approvals.decide(
                expense_id,
                decision,
                &self.user.user_id,
                role,
                reason,
            )?;

            let mut data = state
                .reconciler
                .entity(expense_id)
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            if let serde_json::Value::Object(map) = &mut data {
                map.insert(
                    "approvalStatus".to_string(),
                    serde_json::to_value(decided.status)?,
                );
            }
            let event = state.reconciler.apply_local(
                MutationOp::Update,
                EntityKind::Expense,
                expense_id,
                data,
                Some(group_id.clone()),
            );

            let (kind, summary) = match decision {
                ApprovalDecision::Approve => (
                    ActivityKind::ExpenseApproved,
                    format!("{} approved expense {}", self.user.user_id, expense_id),
                ),
                ApprovalDecision::Reject => (
                    ActivityKind::ExpenseRejected,
                    format!(
                        "{} rejected expense {}: {}",
                        self.user.user_id,
                        expense_id,
                        decided.reason.as_deref().unwrap_or("")
                    ),
                ),
            };
            let entry = ActivityEntry::new(kind, self.user.user_id.as_str(), expense_id, summary)
                .with_group(group_id);
            state.activity.record(entry.clone());
            (decided, event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(decided)
    }

    /// Add a member to a group. Requires admin role in that group.
    pub async fn add_member(&self, group_id: &str, member: GroupMember) -> Result<()> {
        let (event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            self.require_admin(state, group_id)?;
            state.registry.add_member(group_id, member.clone())?;

            let data = serde_json::to_value(&member)?;
            let event = state.reconciler.apply_local(
                MutationOp::Create,
                EntityKind::Member,
                member.user_id.clone(),
                data,
                Some(group_id.to_string()),
            );
            let entry = ActivityEntry::from_mutation(&event);
            state.activity.record(entry.clone());
            (event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(())
    }

    /// Remove a member from a group. Requires admin role; removing the
    /// last active admin is rejected.
    pub async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        let (event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            self.require_admin(state, group_id)?;
            state.registry.remove_member(group_id, user_id)?;

            let event = state.reconciler.apply_local(
                MutationOp::Delete,
                EntityKind::Member,
                user_id,
                serde_json::json!({}),
                Some(group_id.to_string()),
            );
            let entry = ActivityEntry::from_mutation(&event);
            state.activity.record(entry.clone());
            (event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(())
    }

    /// Change a member's role. Requires admin role; demoting the last
    /// active admin is rejected.
    pub async fn change_role(
        &self,
        group_id: &str,
        user_id: &str,
        role: MemberRole,
    ) -> Result<()> {
        let (event, entry) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            self.require_admin(state, group_id)?;
            state.registry.change_role(group_id, user_id, role)?;

            let event = state.reconciler.apply_local(
                MutationOp::Update,
                EntityKind::Member,
                user_id,
                serde_json::json!({ "role": role }),
                Some(group_id.to_string()),
            );
            let entry = ActivityEntry::from_mutation(&event);
            state.activity.record(entry.clone());
            (event, entry)
        };

        self.broadcast_change(&event, &entry).await;
        Ok(())
    }

    /// Activity feed, newest first, optionally filtered to one group.
    pub async fn recent_activity(&self, group_id: Option<&str>) -> Vec<ActivityEntry> {
        self.state.lock().await.activity.list(group_id)
    }

    /// Current version of an expense; `None` when unknown or deleted.
    pub async fn expense(&self, expense_id: &str) -> Option<Expense> {
        let state = self.state.lock().await;
        state
            .reconciler
            .entity(expense_id)
            .and_then(|data| serde_json::from_value(data.clone()).ok())
    }

    pub async fn approval_request(&self, expense_id: &str) -> Option<ApprovalRequest> {
        self.state.lock().await.approvals.request(expense_id).cloned()
    }

    pub async fn group(&self, group_id: &str) -> Option<Group> {
        self.state.lock().await.registry.group(group_id).cloned()
    }

    /// Write the current state to the snapshot store, if one is attached.
    pub async fn save_snapshot(&self) -> Result<()> {
        let Some(store) = &self.snapshots else {
            debug!("No snapshot store attached");
            return Ok(());
        };
        let snapshot = self.state.lock().await.capture_snapshot();
        store.save(&snapshot).await?;
        self.state.lock().await.stats.snapshots_saved += 1;
        Ok(())
    }

    pub async fn stats(&self) -> SessionStats {
        self.state.lock().await.stats
    }

    pub async fn reconcile_counts(&self) -> ReconcileCounts {
        self.state.lock().await.reconciler.counts()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// The underlying connection, for status subscriptions.
    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.connection.clone()
    }

    fn require_admin(&self, state: &SessionState, group_id: &str) -> Result<()> {
        if state.registry.group(group_id).is_none() {
            return Err(SyncError::State(format!("unknown group: {}", group_id)));
        }
        match state.registry.active_role(group_id, &self.user.user_id) {
            Some(MemberRole::Admin) => Ok(()),
            Some(role) => Err(SyncError::Authorization(format!(
                "membership changes require admin, {} is {}",
                self.user.user_id, role
            ))),
            None => Err(SyncError::Authorization(format!(
                "{} is not an active member of {}",
                self.user.user_id, group_id
            ))),
        }
    }

    async fn announce_presence(&self, payload: &PresencePayload) {
        match Envelope::presence_update(self.user.user_id.as_str(), payload) {
            Ok(envelope) => self.broadcast(envelope).await,
            Err(e) => warn!(error = %e, "Presence payload did not serialize"),
        }
    }

    async fn broadcast_change(&self, event: &MutationEvent, entry: &ActivityEntry) {
        match Envelope::mutation(event) {
            Ok(envelope) => self.broadcast(envelope).await,
            Err(e) => warn!(error = %e, "Mutation did not serialize"),
        }
        match Envelope::activity(entry) {
            Ok(envelope) => self.broadcast(envelope).await,
            Err(e) => warn!(error = %e, "Activity entry did not serialize"),
        }
    }

    /// Send if connected; offline changes stay local and are not queued.
    async fn broadcast(&self, envelope: Envelope) {
        match self.connection.send(envelope).await {
            Ok(()) => {}
            Err(SyncError::NotConnected) => debug!("Offline, change kept locally"),
            Err(e) => warn!(error = %e, "Broadcast failed"),
        }
    }
}

fn validate_expense(expense: &Expense) -> Result<()> {
    if !expense.amount.is_finite() || expense.amount <= 0.0 {
        return Err(SyncError::Validation(format!(
            "expense amount must be positive, got {}",
            expense.amount
        )));
    }
    if expense.description.trim().is_empty() {
        return Err(SyncError::Validation(
            "expense description must not be empty".into(),
        ));
    }
    Ok(())
}

/// The spawned half of a session: consumes inbound envelopes and runs the
/// periodic eviction and autosave timers.
struct SessionLoop {
    user_id: String,
    state: Arc<Mutex<SessionState>>,
    connection: Arc<ConnectionManager>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    local_presence: Arc<Mutex<PresencePayload>>,
    eviction_interval: Duration,
    autosave_interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl SessionLoop {
    async fn run(mut self) {
        let mut messages = self.connection.subscribe_messages();
        let mut status = self.connection.subscribe_status();
        let mut evict = interval(self.eviction_interval);
        // No point saving right after the snapshot was loaded
        let mut autosave = interval_at(
            Instant::now() + self.autosave_interval,
            self.autosave_interval,
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                result = messages.recv() => match result {
                    Ok(envelope) => handle_envelope(&self.state, &self.user_id, envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Inbound receiver lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                result = status.recv() => match result {
                    Ok(ConnectionState::Connected) => self.on_reconnected().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = evict.tick() => {
                    let mut state = self.state.lock().await;
                    let evicted = state.presence.evict_stale(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, "Evicted stale presence records");
                    }
                }
                _ = autosave.tick() => self.autosave().await,
            }
        }
        debug!("Session loop stopped");
    }

    /// The connection dropped and came back: collaborators have evicted
    /// our presence by now, so announce it again.
    async fn on_reconnected(&self) {
        self.state.lock().await.stats.reconnects += 1;

        let payload = self.local_presence.lock().await.clone();
        match Envelope::presence_update(self.user_id.as_str(), &payload) {
            Ok(envelope) => {
                if let Err(e) = self.connection.send(envelope).await {
                    debug!(error = %e, "Presence re-announcement not sent");
                } else {
                    info!("Re-announced presence after reconnect");
                }
            }
            Err(e) => warn!(error = %e, "Presence payload did not serialize"),
        }
    }

    async fn autosave(&self) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let snapshot = self.state.lock().await.capture_snapshot();
        match store.save(&snapshot).await {
            Ok(()) => self.state.lock().await.stats.snapshots_saved += 1,
            Err(e) => {
                self.state.lock().await.stats.snapshot_failures += 1;
                warn!(error = %e, "Snapshot autosave failed");
            }
        }
    }
}

/// Dispatch one inbound envelope into session state.
async fn handle_envelope(state: &Mutex<SessionState>, local_user: &str, envelope: Envelope) {
    let mut state = state.lock().await;
    let state = &mut *state;

    match envelope.kind {
        // Liveness is tracked at the connection layer
        MessageType::Heartbeat => {}

        MessageType::PresenceUpdate => {
            if envelope.user_id == local_user {
                return;
            }
            let payload = match envelope.presence_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    state.stats.malformed_payloads += 1;
                    warn!(error = %e, "Dropping malformed presence payload");
                    return;
                }
            };
            let display_name = state
                .registry
                .display_name(&envelope.user_id)
                .unwrap_or_else(|| envelope.user_id.clone());
            let mut record =
                PresenceRecord::new(envelope.user_id.as_str(), display_name, payload.status)
                    .with_last_seen(envelope.timestamp);
            record.scope = payload.scope;
            record.editing_entity_id = payload.editing_entity_id;
            if state.presence.update(record) {
                state.stats.presence_updates += 1;
            }
        }

        MessageType::Mutation => {
            let event = match envelope.mutation_event() {
                Ok(event) => event,
                Err(e) => {
                    state.stats.malformed_payloads += 1;
                    warn!(error = %e, "Dropping malformed mutation payload");
                    return;
                }
            };
            let outcome = state.reconciler.receive_remote(&event);
            if outcome == ReceiveOutcome::Applied {
                match event.entity_type {
                    EntityKind::Member => apply_membership(state, &event),
                    EntityKind::Expense => note_approval_state(state, &event),
                    EntityKind::Group => {}
                }
            }
        }

        MessageType::Activity => {
            let entry = match envelope.activity_entry() {
                Ok(entry) => entry,
                Err(e) => {
                    state.stats.malformed_payloads += 1;
                    warn!(error = %e, "Dropping malformed activity payload");
                    return;
                }
            };
            // Our own entries were recorded when the operation ran
            if entry.user_id == local_user || state.activity.contains(&entry.id) {
                return;
            }
            state.stats.activity_received += 1;
            state.activity.record(entry);
        }
    }
}

/// Keep the approval workflow in step with the approval status carried by
/// a remote expense mutation, so requests raised elsewhere can be decided
/// here.
fn note_approval_state(state: &mut SessionState, event: &MutationEvent) {
    let Some(status) = event.data.get("approvalStatus") else {
        return;
    };
    match serde_json::from_value::<ApprovalStatus>(status.clone()) {
        Ok(status) => state.approvals.note_remote(
            &event.entity_id,
            status,
            &event.origin_user_id,
            event.group_id.as_deref(),
            event.origin_timestamp,
        ),
        Err(e) => warn!(event_id = %event.id, error = %e, "Unreadable approval status"),
    }
}

/// Mirror an accepted remote membership mutation into the registry. The
/// origin already enforced authorization; divergence here is logged and
/// skipped rather than propagated.
fn apply_membership(state: &mut SessionState, event: &MutationEvent) {
    let Some(group_id) = event.group_id.as_deref() else {
        warn!(event_id = %event.id, "Member mutation without a group");
        return;
    };

    let applied = match event.op {
        MutationOp::Create => serde_json::from_value::<GroupMember>(event.data.clone())
            .map_err(SyncError::from)
            .and_then(|member| state.registry.add_member(group_id, member)),
        MutationOp::Delete => state
            .registry
            .remove_member(group_id, &event.entity_id)
            .map(|_| ()),
        MutationOp::Update => event
            .data
            .get("role")
            .cloned()
            .ok_or_else(|| SyncError::Protocol("member update without a role".into()))
            .and_then(|value| serde_json::from_value::<MemberRole>(value).map_err(SyncError::from))
            .and_then(|role| {
                state
                    .registry
                    .change_role(group_id, &event.entity_id, role)
                    .map(|_| ())
            }),
    };

    if let Err(e) = applied {
        warn!(event_id = %event.id, error = %e, "Remote membership change not applied");
    }
}
