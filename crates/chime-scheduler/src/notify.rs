//! Delivery log — what fired, for whom, and how the hand-off went.
//! In-memory ring buffer; the fanout itself keeps no history.

use std::collections::VecDeque;

use chime_core::Instant;
use chime_core::types::{DeliveryOutcome, ItemKey, OwnerId};
use serde::Serialize;

const DEFAULT_CAPACITY: usize = 100;

/// One fired reminder.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryEntry {
    pub key: ItemKey,
    pub owner_id: OwnerId,
    pub title: String,
    pub due_instant: Instant,
    pub fired_at: Instant,
    pub outcome: DeliveryOutcome,
}

/// Bounded history of fired reminders (oldest evicted first).
pub struct DeliveryLog {
    entries: VecDeque<DeliveryEntry>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, entry: DeliveryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Most recent first, optionally for a single owner.
    pub fn recent(&self, owner_id: Option<OwnerId>, limit: usize) -> Vec<DeliveryEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| owner_id.is_none_or(|o| e.owner_id == o))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DeliveryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: i64, owner: OwnerId) -> DeliveryEntry {
        DeliveryEntry {
            key: ItemKey::event(id),
            owner_id: owner,
            title: format!("event {id}"),
            due_instant: Utc::now(),
            fired_at: Utc::now(),
            outcome: DeliveryOutcome::NoRecipient,
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut log = DeliveryLog::with_capacity(3);
        for id in 1..=5 {
            log.record(entry(id, 1));
        }
        assert_eq!(log.len(), 3);
        let ids: Vec<i64> = log.recent(None, 10).iter().map(|e| e.key.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_recent_filters_by_owner() {
        let mut log = DeliveryLog::new();
        log.record(entry(1, 1));
        log.record(entry(2, 2));
        log.record(entry(3, 1));
        let mine = log.recent(Some(1), 10);
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|e| e.owner_id == 1));
        assert_eq!(log.recent(Some(1), 1).len(), 1);
    }
}
