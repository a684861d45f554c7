//! Seams between the reminder engine and its collaborators.
//!
//! The scheduler only depends on these traits, so storage, the inference
//! service, and the live-session layer can be swapped (or faked in tests)
//! without touching the scan loop.

use async_trait::async_trait;

use crate::error::Result;
use crate::time::Instant;
use crate::types::{DeliveryOutcome, ItemKey, ItemKind, Notification, OwnerId, ReminderItem};

/// Read-mostly view over persisted events and tasks.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Active items with a known due instant no older than `now - lookback`.
    ///
    /// The outer error means the whole query failed (retry next tick); an inner
    /// error is a single unreadable row that should be logged and skipped.
    async fn list_active_items(
        &self,
        now: Instant,
        lookback: chrono::Duration,
    ) -> Result<Vec<Result<ReminderItem>>>;

    /// Record a computed lead time. Only the first write for an item sticks.
    async fn persist_lead_minutes(&self, key: ItemKey, minutes: u32) -> Result<()>;

    /// Current due instant of an item that is still eligible to fire at `now`
    /// (the same `now` the tick was evaluated against). `None` when the item
    /// is gone, completed, past, or has no due instant.
    async fn due_instant(&self, key: ItemKey, now: Instant) -> Result<Option<Instant>>;
}

/// Free-text heuristic for "how many minutes before due should we remind".
/// Implementations never fail; they degrade to a configured default.
#[async_trait]
pub trait LeadTimeEstimator: Send + Sync {
    fn name(&self) -> &str;

    async fn estimate(&self, kind: ItemKind, description: Option<&str>) -> u32;
}

/// Where fired reminders are handed off.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, owner_id: OwnerId, notification: &Notification) -> DeliveryOutcome;
}
