//! Presence tracking for remote collaborators.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::PresenceConfig;
use crate::types::PresenceRecord;

/// Tracks which collaborators are online, keyed by user id.
///
/// Records arrive via presence messages and age out after the staleness
/// window. Updates carrying a `lastSeen` older than the current record are
/// discarded, so reordered messages cannot roll presence backwards.
pub struct PresenceTracker {
    records: HashMap<String, PresenceRecord>,
    staleness_window: Duration,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig) -> Self {
        let staleness_window = Duration::from_std(config.staleness_window)
            .unwrap_or_else(|_| Duration::seconds(45));
        Self {
            records: HashMap::new(),
            staleness_window,
        }
    }

    /// Apply a presence record. Returns false when the record is older
    /// than what is already tracked for that user.
    pub fn update(&mut self, record: PresenceRecord) -> bool {
        if let Some(existing) = self.records.get(&record.user_id) {
            if existing.last_seen > record.last_seen {
                debug!(
                    user_id = %record.user_id,
                    "Discarding out-of-order presence update"
                );
                return false;
            }
        }
        self.records.insert(record.user_id.clone(), record);
        true
    }

    /// Remove records whose `lastSeen` is outside the staleness window.
    /// Returns how many were evicted.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.staleness_window;
        let before = self.records.len();
        self.records.retain(|_, record| record.last_seen >= cutoff);
        let evicted = before - self.records.len();
        if evicted > 0 {
            debug!(evicted, "Evicted stale presence records");
        }
        evicted
    }

    /// Online collaborators visible to `requester`, excluding the
    /// requester's own record. `scope` of `Some(group)` returns records in
    /// that group; `None` returns personal-scope records.
    pub fn online(&self, requester: &str, scope: Option<&str>) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .records
            .values()
            .filter(|record| record.user_id != requester)
            .filter(|record| match scope {
                Some(group) => record.scope.as_deref() == Some(group),
                None => record.scope.is_none(),
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PresenceStatus;
    use std::time::Duration as StdDuration;

    fn tracker_with_window(secs: u64) -> PresenceTracker {
        PresenceTracker::new(&PresenceConfig {
            staleness_window: StdDuration::from_secs(secs),
            ..PresenceConfig::default()
        })
    }

    #[test]
    fn test_out_of_order_update_discarded() {
        let mut tracker = tracker_with_window(45);
        let now = Utc::now();

        let newer = PresenceRecord::new("user-2", "Bea", PresenceStatus::Editing)
            .with_editing("exp-3")
            .with_last_seen(now);
        let older = PresenceRecord::new("user-2", "Bea", PresenceStatus::Away)
            .with_last_seen(now - Duration::seconds(10));

        assert!(tracker.update(newer));
        assert!(!tracker.update(older));
        let kept = tracker.get("user-2").unwrap();
        assert_eq!(kept.status, PresenceStatus::Editing);
        assert_eq!(kept.editing_entity_id.as_deref(), Some("exp-3"));
    }

    #[test]
    fn test_evict_stale_records() {
        let mut tracker = tracker_with_window(45);
        let now = Utc::now();

        tracker.update(
            PresenceRecord::new("user-2", "Bea", PresenceStatus::Viewing)
                .with_last_seen(now - Duration::seconds(60)),
        );
        tracker.update(
            PresenceRecord::new("user-3", "Cal", PresenceStatus::Viewing)
                .with_last_seen(now - Duration::seconds(10)),
        );

        assert_eq!(tracker.evict_stale(now), 1);
        assert!(tracker.get("user-2").is_none());
        assert!(tracker.get("user-3").is_some());
    }

    #[test]
    fn test_online_excludes_requester_and_filters_scope() {
        let mut tracker = tracker_with_window(45);

        tracker.update(PresenceRecord::new("user-1", "Ana", PresenceStatus::Viewing));
        tracker.update(
            PresenceRecord::new("user-2", "Bea", PresenceStatus::Viewing).with_scope("grp-1"),
        );
        tracker.update(PresenceRecord::new("user-3", "Cal", PresenceStatus::Viewing));

        let personal = tracker.online("user-1", None);
        assert_eq!(personal.len(), 1);
        assert_eq!(personal[0].user_id, "user-3");

        let grouped = tracker.online("user-1", Some("grp-1"));
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].user_id, "user-2");

        // The requester's own record never comes back to them.
        let own_view = tracker.online("user-3", None);
        assert!(own_view.iter().all(|r| r.user_id != "user-3"));
    }

    #[test]
    fn test_online_after_eviction_never_returns_stale() {
        let mut tracker = tracker_with_window(45);
        let now = Utc::now();

        tracker.update(
            PresenceRecord::new("user-2", "Bea", PresenceStatus::Viewing)
                .with_last_seen(now - Duration::seconds(46)),
        );
        tracker.evict_stale(now);

        assert!(tracker.online("user-1", None).is_empty());
    }
}
