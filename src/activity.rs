//! Bounded activity feed.

use std::collections::VecDeque;

use tracing::debug;

use crate::config::ActivityConfig;
use crate::types::ActivityEntry;

/// Append-only feed over accepted mutations and membership events,
/// newest first, with FIFO eviction past capacity.
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(config: &ActivityConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an entry, evicting the oldest once over capacity.
    pub fn record(&mut self, entry: ActivityEntry) {
        debug!(entry_id = %entry.id, kind = ?entry.kind, "Recorded activity");
        self.entries.push_front(entry);

        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// Whether an entry with this id is still in the window.
    pub fn contains(&self, entry_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == entry_id)
    }

    /// Entries newest first, optionally filtered to one group.
    pub fn list(&self, group_id: Option<&str>) -> Vec<ActivityEntry> {
        self.entries
            .iter()
            .filter(|entry| match group_id {
                Some(group) => entry.group_id.as_deref() == Some(group),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// The `limit` newest entries across all groups.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries newest first, for snapshotting.
    pub fn export(&self) -> Vec<ActivityEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Refill from a snapshot, trimming to capacity.
    pub fn restore(&mut self, entries: Vec<ActivityEntry>) {
        self.entries = entries.into_iter().take(self.capacity).collect();
    }
}
