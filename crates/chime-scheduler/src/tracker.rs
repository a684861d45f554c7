//! Delivery state tracker — at most one reminder per `(item, due_instant)`.
//!
//! One mutex guards the whole map; each operation is a short critical
//! section, so claims for different items never wait on I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chime_core::Instant;
use chime_core::types::ItemKey;

/// Where a claimed due instant is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Picked by a tick, not yet handed to the fanout.
    Claimed,
    /// Handed to the fanout at `fired_at`.
    Fired { fired_at: Instant },
}

/// Firing state of one item, tied to the due instant it was claimed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub due_instant: Instant,
    pub state: ClaimState,
}

impl DeliveryRecord {
    pub fn fired_at(&self) -> Option<Instant> {
        match self.state {
            ClaimState::Fired { fired_at } => Some(fired_at),
            ClaimState::Claimed => None,
        }
    }
}

/// Shared, cloneable handle to the delivery records.
#[derive(Clone, Default)]
pub struct DeliveryTracker {
    records: Arc<Mutex<HashMap<ItemKey, DeliveryRecord>>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ItemKey, DeliveryRecord>> {
        // A panic while holding this lock cannot leave a half-written record.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Compare-and-set on `(key, due_instant)`.
    ///
    /// Returns `true` exactly once per due instant. A record for a different
    /// due instant means the item was rescheduled and is replaced.
    pub fn try_claim(&self, key: ItemKey, due_instant: Instant) -> bool {
        let mut records = self.lock();
        match records.get(&key) {
            Some(rec) if rec.due_instant == due_instant => false,
            Some(rec) => {
                tracing::debug!(
                    "🔁 {key} rescheduled ({} → {}), re-arming",
                    rec.due_instant,
                    due_instant
                );
                records.insert(key, DeliveryRecord { due_instant, state: ClaimState::Claimed });
                true
            }
            None => {
                records.insert(key, DeliveryRecord { due_instant, state: ClaimState::Claimed });
                true
            }
        }
    }

    /// Like [`try_claim`](Self::try_claim), but returns a guard that releases
    /// the claim on drop unless it is marked fired.
    pub fn claim(&self, key: ItemKey, due_instant: Instant) -> Option<ClaimGuard> {
        self.try_claim(key, due_instant).then(|| ClaimGuard {
            tracker: self.clone(),
            key,
            due_instant,
            settled: false,
        })
    }

    /// Record the fanout hand-off for a claimed due instant.
    pub fn mark_fired(&self, key: ItemKey, due_instant: Instant, fired_at: Instant) {
        let mut records = self.lock();
        if let Some(rec) = records.get_mut(&key) {
            if rec.due_instant == due_instant {
                rec.state = ClaimState::Fired { fired_at };
            }
        }
    }

    /// Drop an unfired claim so a later tick can try again.
    pub fn release(&self, key: ItemKey, due_instant: Instant) {
        let mut records = self.lock();
        let unfired = records
            .get(&key)
            .is_some_and(|rec| rec.due_instant == due_instant && rec.state == ClaimState::Claimed);
        if unfired {
            records.remove(&key);
        }
    }

    /// Forget an item entirely (deleted, rescheduled, or completed).
    pub fn invalidate(&self, key: ItemKey) -> bool {
        self.lock().remove(&key).is_some()
    }

    /// Drop fired records whose due instant is older than `cutoff`.
    /// Such items are outside the lookback window and are no longer scanned.
    pub fn prune(&self, cutoff: Instant) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, rec| rec.due_instant >= cutoff || rec.state == ClaimState::Claimed);
        before - records.len()
    }

    pub fn record(&self, key: ItemKey) -> Option<DeliveryRecord> {
        self.lock().get(&key).copied()
    }

    pub fn is_fired(&self, key: ItemKey, due_instant: Instant) -> bool {
        self.record(key)
            .is_some_and(|rec| rec.due_instant == due_instant && rec.fired_at().is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// An outstanding claim. Dropping it without [`fired`](Self::fired) releases it.
pub struct ClaimGuard {
    tracker: DeliveryTracker,
    key: ItemKey,
    due_instant: Instant,
    settled: bool,
}

impl ClaimGuard {
    pub fn key(&self) -> ItemKey {
        self.key
    }

    pub fn due_instant(&self) -> Instant {
        self.due_instant
    }

    pub fn fired(mut self, fired_at: Instant) {
        self.tracker.mark_fired(self.key, self.due_instant, fired_at);
        self.settled = true;
    }

    pub fn release(mut self) {
        self.tracker.release(self.key, self.due_instant);
        self.settled = true;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.release(self.key, self.due_instant);
        }
    }
}
