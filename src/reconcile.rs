//! Optimistic mutation reconciliation.
//!
//! Local mutations apply immediately and go out for broadcast; remote
//! mutations merge in through a deterministic last-writer-wins rule keyed
//! on origin timestamp, with ties broken by the lexicographically larger
//! event id. A bounded seen-id set makes redelivery and echoes idempotent.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReconcilerConfig;
use crate::types::{EntityKind, MutationEvent, MutationOp};

/// How `receive_remote` disposed of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Applied to local state
    Applied,
    /// Event id already seen; redelivery or echo
    Duplicate,
    /// Originated from the local user, arriving back late
    SelfEcho,
    /// Lost last-writer-wins against already-applied state
    Stale,
    /// Create for an entity id that already exists
    DuplicateCreate,
    /// Missing required fields; dropped and counted
    Malformed,
}

/// Counters kept by the reconciler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileCounts {
    pub local_applied: u64,
    pub remote_applied: u64,
    pub duplicates: u64,
    pub self_echoes: u64,
    pub stale: u64,
    pub duplicate_creates: u64,
    pub malformed: u64,
}

/// Last-applied version and payload for one entity. Deletes leave a
/// tombstone so later out-of-date updates still lose the comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntity {
    pub kind: EntityKind,
    pub data: serde_json::Value,
    pub origin_timestamp: DateTime<Utc>,
    pub event_id: String,
    pub deleted: bool,
}

impl StoredEntity {
    pub fn from_event(event: &MutationEvent) -> Self {
        Self {
            kind: event.entity_type,
            data: event.data.clone(),
            origin_timestamp: event.origin_timestamp,
            event_id: event.id.clone(),
            deleted: event.op == MutationOp::Delete,
        }
    }

    /// True when the stored version wins against the candidate.
    fn wins_against(&self, timestamp: DateTime<Utc>, event_id: &str) -> bool {
        self.origin_timestamp > timestamp
            || (self.origin_timestamp == timestamp && self.event_id.as_str() >= event_id)
    }
}

/// Insertion-ordered bounded id set.
struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_front(id.to_string());

        // Prune oldest ids over capacity
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_back() {
                self.ids.remove(&evicted);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// The optimistic-update engine for one session.
pub struct MutationReconciler {
    local_user: String,
    seen: SeenSet,
    entities: HashMap<String, StoredEntity>,
    counts: ReconcileCounts,
}

impl MutationReconciler {
    pub fn new(local_user: impl Into<String>, config: &ReconcilerConfig) -> Self {
        Self {
            local_user: local_user.into(),
            seen: SeenSet::new(config.seen_capacity),
            entities: HashMap::new(),
            counts: ReconcileCounts::default(),
        }
    }

    /// Apply a local mutation immediately and return the event to
    /// broadcast. The event id is recorded so the echo coming back from
    /// the server is ignored.
    pub fn apply_local(
        &mut self,
        op: MutationOp,
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        data: serde_json::Value,
        group_id: Option<String>,
    ) -> MutationEvent {
        let event = MutationEvent::new(
            op,
            entity_type,
            entity_id,
            data,
            self.local_user.clone(),
            group_id,
        );

        self.store(&event);
        self.seen.insert(&event.id);
        self.counts.local_applied += 1;
        debug!(
            event_id = %event.id,
            entity_id = %event.entity_id,
            op = %event.op,
            "Applied local mutation"
        );
        event
    }

    /// Merge a remote mutation. Idempotent: redelivering the same event
    /// leaves local state unchanged.
    pub fn receive_remote(&mut self, event: &MutationEvent) -> ReceiveOutcome {
        if !event.is_well_formed() {
            self.counts.malformed += 1;
            warn!("Dropping malformed mutation event");
            return ReceiveOutcome::Malformed;
        }

        if self.seen.contains(&event.id) {
            self.counts.duplicates += 1;
            return ReceiveOutcome::Duplicate;
        }
        // Recorded no matter how the event is disposed of below, so a
        // redelivered copy is always a cheap no-op.
        self.seen.insert(&event.id);

        if event.origin_user_id == self.local_user {
            self.counts.self_echoes += 1;
            debug!(event_id = %event.id, "Discarding self-echo");
            return ReceiveOutcome::SelfEcho;
        }

        let outcome = match event.op {
            MutationOp::Create => {
                if self.entities.contains_key(&event.entity_id) {
                    self.counts.duplicate_creates += 1;
                    ReceiveOutcome::DuplicateCreate
                } else {
                    self.store(event);
                    ReceiveOutcome::Applied
                }
            }
            MutationOp::Update | MutationOp::Delete => match self.entities.get(&event.entity_id) {
                Some(existing)
                    if existing.wins_against(event.origin_timestamp, &event.id) =>
                {
                    self.counts.stale += 1;
                    ReceiveOutcome::Stale
                }
                _ => {
                    self.store(event);
                    ReceiveOutcome::Applied
                }
            },
        };

        if outcome == ReceiveOutcome::Applied {
            self.counts.remote_applied += 1;
            debug!(
                event_id = %event.id,
                entity_id = %event.entity_id,
                op = %event.op,
                "Applied remote mutation"
            );
        }
        outcome
    }

    /// Whether this event id has already been processed.
    pub fn is_duplicate(&self, event: &MutationEvent) -> bool {
        self.seen.contains(&event.id)
    }

    /// Live payload for an entity; `None` when unknown or deleted.
    pub fn entity(&self, entity_id: &str) -> Option<&serde_json::Value> {
        self.entities
            .get(entity_id)
            .filter(|stored| !stored.deleted)
            .map(|stored| &stored.data)
    }

    /// Number of live entities.
    pub fn live_entities(&self) -> usize {
        self.entities.values().filter(|e| !e.deleted).count()
    }

    pub fn counts(&self) -> ReconcileCounts {
        self.counts
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Entity table for snapshotting, tombstones included.
    pub fn export_entities(&self) -> HashMap<String, StoredEntity> {
        self.entities.clone()
    }

    /// Replace the entity table from a snapshot.
    pub fn restore_entities(&mut self, entities: HashMap<String, StoredEntity>) {
        self.entities = entities;
    }

    fn store(&mut self, event: &MutationEvent) {
        self.entities
            .insert(event.entity_id.clone(), StoredEntity::from_event(event));
    }
}
