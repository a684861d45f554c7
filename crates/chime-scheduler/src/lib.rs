//! # Chime Scheduler
//!
//! The due-set scanner, the delivery state tracker, and the SQLite store
//! the scanner reads events and tasks from.
//!
//! ## Design
//! - One tokio interval drives every scan; nothing runs between ticks
//! - Each item is evaluated on its own; one bad row never stalls the rest
//! - At most one reminder per `(item, due_instant)`, re-armed on reschedule
//! - Delivery state lives in memory; a restart may re-fire a reminder once
//!
//! ```text
//! ReminderEngine (tokio interval)
//!   ├── ItemSource::list_active_items(now, lookback)
//!   ├── per item (bounded workers):
//!   │     ├── LeadTimeEstimator  (only when no lead time is stored)
//!   │     ├── threshold = due_instant - lead_minutes <= now ?
//!   │     ├── DeliveryTracker::claim(key, due_instant)
//!   │     └── NotificationSink::deliver(owner_id, payload)
//!   └── DeliveryLog (last 100 fired reminders)
//! ```

pub mod engine;
pub mod notify;
pub mod persistence;
pub mod tracker;

pub use engine::{ItemOutcome, ItemReport, ReminderEngine, TickReport};
pub use notify::{DeliveryEntry, DeliveryLog};
pub use persistence::{EventPatch, ItemChange, NewEvent, NewTask, ReminderDb, TaskPatch};
pub use tracker::{ClaimGuard, ClaimState, DeliveryRecord, DeliveryTracker};
