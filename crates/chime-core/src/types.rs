//! Reminder data model — the read-only view the engine takes over events and tasks.

use serde::{Deserialize, Serialize};

use crate::error::ChimeError;
use crate::time::{Instant, format_instant};

/// Identifier of the user who owns an item and receives its reminders.
pub type OwnerId = i64;

/// Which kind of calendar item a reminder belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Event,
    Task,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Event => "event",
            ItemKind::Task => "task",
        }
    }

    /// Display color used when the client does not pick one.
    pub fn default_color(&self) -> &'static str {
        match self {
            ItemKind::Event => "blue",
            ItemKind::Task => "green",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemKind {
    type Err = ChimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" => Ok(ItemKind::Event),
            "task" => Ok(ItemKind::Task),
            other => Err(ChimeError::Validation(format!("unknown item kind '{other}'"))),
        }
    }
}

/// Identity of an item: ids are only unique within their kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub kind: ItemKind,
    pub id: i64,
}

impl ItemKey {
    pub fn new(kind: ItemKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn event(id: i64) -> Self {
        Self::new(ItemKind::Event, id)
    }

    pub fn task(id: i64) -> Self {
        Self::new(ItemKind::Task, id)
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Kind-specific fields carried alongside the common reminder view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ItemDetails {
    Event {
        end_instant: Option<Instant>,
        color: String,
    },
    Task {
        is_completed: bool,
        color: String,
    },
}

/// An event or task as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderItem {
    pub id: i64,
    pub kind: ItemKind,
    pub owner_id: OwnerId,
    pub title: String,
    pub description: Option<String>,
    /// Items without a due instant never fire.
    pub due_instant: Option<Instant>,
    /// Minutes before `due_instant` at which to remind; `None` until estimated.
    pub lead_minutes: Option<u32>,
    pub active: bool,
    pub details: ItemDetails,
}

impl ReminderItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.kind, self.id)
    }

    /// `due_instant - lead_minutes`, when both are known.
    pub fn threshold(&self) -> Option<Instant> {
        let due = self.due_instant?;
        let lead = self.lead_minutes?;
        Some(
            due.checked_sub_signed(chrono::Duration::minutes(i64::from(lead)))
                .unwrap_or(Instant::MIN_UTC),
        )
    }

    /// Whether the reminder threshold has been reached at `now`.
    /// Says nothing about whether it already fired; that is the tracker's job.
    pub fn threshold_reached(&self, now: Instant) -> bool {
        self.active && self.threshold().is_some_and(|t| t <= now)
    }
}

/// Extras that differ between event and task notifications.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_instant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Free-form note shown under the title; mirrors the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Payload of the outbound `notification` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub item_id: i64,
    pub title: String,
    pub description: Option<String>,
    /// ISO-8601, UTC, millisecond precision, `Z` suffix.
    pub due_instant: String,
    pub lead_minutes: u32,
    #[serde(flatten)]
    pub extras: NotificationExtras,
}

impl Notification {
    /// Build the payload for an item firing against a specific due instant.
    pub fn for_item(item: &ReminderItem, due_instant: Instant, lead_minutes: u32) -> Self {
        let extras = match &item.details {
            ItemDetails::Event { end_instant, color } => NotificationExtras {
                end_instant: end_instant.as_ref().map(format_instant),
                is_completed: None,
                color: Some(color.clone()),
                note: item.description.clone(),
            },
            ItemDetails::Task { is_completed, color } => NotificationExtras {
                end_instant: None,
                is_completed: Some(*is_completed),
                color: Some(color.clone()),
                note: item.description.clone(),
            },
        };
        Self {
            kind: item.kind,
            item_id: item.id,
            title: item.title.clone(),
            description: item.description.clone(),
            due_instant: format_instant(&due_instant),
            lead_minutes,
            extras,
        }
    }
}

/// Result of handing a notification to the fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The owner had no live session. Not an error.
    NoRecipient,
    /// At least one session was targeted; `failed` pushes did not affect the others.
    Delivered { delivered: usize, failed: usize },
}

impl DeliveryOutcome {
    pub fn reached_anyone(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { delivered, .. } if *delivered > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn task(due: Option<Instant>, lead: Option<u32>) -> ReminderItem {
        ReminderItem {
            id: 7,
            kind: ItemKind::Task,
            owner_id: 1,
            title: "Submit report".into(),
            description: Some("submit report".into()),
            due_instant: due,
            lead_minutes: lead,
            active: true,
            details: ItemDetails::Task {
                is_completed: false,
                color: "green".into(),
            },
        }
    }

    #[test]
    fn test_threshold() {
        let due = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let item = task(Some(due), Some(20));
        assert_eq!(
            item.threshold(),
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 9, 40, 0).unwrap())
        );
        assert!(item.threshold_reached(Utc.with_ymd_and_hms(2025, 1, 1, 9, 41, 0).unwrap()));
        assert!(item.threshold_reached(Utc.with_ymd_and_hms(2025, 1, 1, 9, 40, 0).unwrap()));
        assert!(!item.threshold_reached(Utc.with_ymd_and_hms(2025, 1, 1, 9, 39, 59).unwrap()));
    }

    #[test]
    fn test_no_due_never_reaches_threshold() {
        let item = task(None, Some(30));
        assert_eq!(item.threshold(), None);
        assert!(!item.threshold_reached(Utc::now()));
    }

    #[test]
    fn test_inactive_never_reaches_threshold() {
        let due = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut item = task(Some(due), Some(30));
        item.active = false;
        assert!(!item.threshold_reached(due));
    }

    #[test]
    fn test_item_kind_parse() {
        assert_eq!("Event".parse::<ItemKind>().unwrap(), ItemKind::Event);
        assert_eq!("task".parse::<ItemKind>().unwrap(), ItemKind::Task);
        assert!("meeting".parse::<ItemKind>().is_err());
    }

    #[test]
    fn test_notification_payload_shape() {
        let due = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let item = task(Some(due), Some(30));
        let n = Notification::for_item(&item, due, 30);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["title"], "Submit report");
        assert_eq!(json["due_instant"], "2025-01-01T10:00:00.000Z");
        assert_eq!(json["note"], "submit report");
        assert_eq!(json["is_completed"], false);
        assert!(json.get("end_instant").is_none());
    }
}
