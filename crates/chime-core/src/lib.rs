//! # Chime Core
//!
//! Shared vocabulary for the reminder engine: configuration, the error
//! taxonomy, the reminder data model, timestamp normalization, and the
//! traits the scheduler consumes from its collaborators.
//!
//! ```text
//! ItemSource ──► Scanner ──► Tracker ──► Fanout ──► user_<id> sessions
//!                   │
//!                   └──► LeadTimeEstimator (advisory, falls back to defaults)
//! ```

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use config::ChimeConfig;
pub use error::{ChimeError, Result};
pub use time::Instant;
pub use traits::{ItemSource, LeadTimeEstimator, NotificationSink};
pub use types::{
    DeliveryOutcome, ItemDetails, ItemKey, ItemKind, Notification, OwnerId, ReminderItem,
};
