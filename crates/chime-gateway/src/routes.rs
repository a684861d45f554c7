//! API route handlers for the gateway.
//!
//! Item routes are thin: they normalize timestamps at the boundary, write
//! through the reminder store, and keep the delivery tracker in step with
//! reschedules, completions and deletions. The caller's `owner_id` comes in
//! the query string; authentication happens in front of this service.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chime_core::error::ChimeError;
use chime_core::time::{self, Instant, format_instant};
use chime_core::types::{ItemDetails, ItemKey, OwnerId, ReminderItem};
use chime_scheduler::{EventPatch, NewEvent, NewTask, TaskPatch};
use serde::Deserialize;
use serde_json::Value;

use super::server::AppState;

const DEFAULT_NOTIFICATION_LIMIT: usize = 20;

/// A `ChimeError` rendered as `{"ok": false, "error": "..."}`.
pub struct ApiError(pub ChimeError);

impl From<ChimeError> for ApiError {
    fn from(e: ChimeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChimeError::MalformedTimestamp(_) | ChimeError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            ChimeError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if !self.0.is_user_facing() {
            tracing::error!("❌ Request failed: {}", self.0);
        }
        let body = serde_json::json!({"ok": false, "error": self.0.to_string()});
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T = Json<Value>> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: OwnerId,
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub owner_id: Option<OwnerId>,
    pub limit: Option<usize>,
}

// ─── Body helpers ──────────────────────────────────────────────

fn required_str(body: &Value, field: &str) -> Result<String, ChimeError> {
    body[field]
        .as_str()
        .map(String::from)
        .ok_or_else(|| ChimeError::Validation(format!("'{field}' is required")))
}

fn optional_str(body: &Value, field: &str) -> Option<String> {
    body[field].as_str().map(String::from)
}

fn required_instant(body: &Value, field: &str) -> Result<Instant, ChimeError> {
    match &body[field] {
        Value::Null => Err(ChimeError::Validation(format!("'{field}' is required"))),
        Value::String(raw) => time::normalize(raw),
        other => Err(ChimeError::MalformedTimestamp(other.to_string())),
    }
}

/// Absent, null or blank is `None`; anything else must parse.
fn optional_instant(body: &Value, field: &str) -> Result<Option<Instant>, ChimeError> {
    match &body[field] {
        Value::Null => Ok(None),
        Value::String(raw) => time::normalize_optional(Some(raw.as_str())),
        other => Err(ChimeError::MalformedTimestamp(other.to_string())),
    }
}

/// `None` when the field is absent, `Some(None)` when it is null or blank.
fn nullable_instant(body: &Value, field: &str) -> Result<Option<Option<Instant>>, ChimeError> {
    match body.get(field) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(raw)) => Ok(Some(time::normalize_optional(Some(raw.as_str()))?)),
        Some(other) => Err(ChimeError::MalformedTimestamp(other.to_string())),
    }
}

/// Lead time in minutes; accepts a number or a numeric string.
fn optional_minutes(body: &Value, field: &str) -> Result<Option<u32>, ChimeError> {
    let invalid = || {
        ChimeError::Validation(format!(
            "'{field}' must be a non-negative number of minutes, got {}",
            body[field]
        ))
    };
    match &body[field] {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .and_then(|m| u32::try_from(m).ok())
            .map(Some)
            .ok_or_else(invalid),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse::<u32>().map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn optional_bool(body: &Value, field: &str) -> Result<Option<bool>, ChimeError> {
    match &body[field] {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(ChimeError::Validation(format!(
            "'{field}' must be true or false, got {other}"
        ))),
    }
}

/// JSON view of an item, using the field names clients send.
pub fn item_json(item: &ReminderItem) -> Value {
    let mut json = serde_json::json!({
        "id": item.id,
        "type": item.kind,
        "owner_id": item.owner_id,
        "title": item.title,
        "description": item.description,
        "reminder": item.lead_minutes,
        "active": item.active,
    });
    let due = item.due_instant.as_ref().map(format_instant);
    match &item.details {
        ItemDetails::Event { end_instant, color } => {
            json["start_time"] = due.into();
            json["end_time"] = end_instant.as_ref().map(format_instant).into();
            json["color"] = color.clone().into();
        }
        ItemDetails::Task { is_completed, color } => {
            json["due_date"] = due.into();
            json["is_completed"] = (*is_completed).into();
            json["color"] = color.clone().into();
        }
    }
    json
}

// ─── Health / monitoring ───────────────────────────────────────

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chime",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sessions": state.hub.session_count(),
        "tracked_reminders": state.engine.tracker().len(),
        "in_flight": state.engine.in_flight(),
    }))
}

/// Recently fired reminders.
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NotificationQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT);
    let entries = state.engine.recent_deliveries(query.owner_id, limit);
    Json(serde_json::json!({"ok": true, "notifications": entries}))
}

// ─── Items ─────────────────────────────────────────────────────

pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult {
    let items = state.db.list_items_for_owner(owner.owner_id)?;
    let items: Vec<Value> = items.iter().map(item_json).collect();
    Ok(Json(serde_json::json!({"ok": true, "items": items})))
}

/// Create an event. A `reminder` in the body is kept as the lead time;
/// otherwise it is estimated in the background.
pub async fn create_event(
    State(state): State<Arc<AppState>>,
    Query(owner): Query<OwnerQuery>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let new = NewEvent {
        owner_id: owner.owner_id,
        title: required_str(&body, "title")?,
        description: optional_str(&body, "description"),
        start_instant: required_instant(&body, "start_time")?,
        end_instant: required_instant(&body, "end_time")?,
        color: optional_str(&body, "color"),
        lead_minutes: optional_minutes(&body, "reminder")?,
    };
    let item = state.db.insert_event(&new)?;
    tracing::info!("📅 Event #{} '{}' created for owner {}", item.id, item.title, item.owner_id);
    state.engine.backfill_lead_time(item.clone());
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"ok": true, "event": item_json(&item)})),
    ))
}

pub async fn update_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
    Json(body): Json<Value>,
) -> ApiResult {
    let patch = EventPatch {
        title: optional_str(&body, "title"),
        description: optional_str(&body, "description"),
        start_instant: optional_instant(&body, "start_time")?,
        end_instant: optional_instant(&body, "end_time")?,
        color: optional_str(&body, "color"),
        lead_minutes: optional_minutes(&body, "reminder")?,
    };
    let change = state.db.update_event(id, owner.owner_id, &patch)?;
    if change.rescheduled {
        state.engine.invalidate(change.item.key());
    }
    Ok(Json(serde_json::json!({"ok": true, "event": item_json(&change.item)})))
}

pub async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult {
    delete_item(&state, ItemKey::event(id), owner.owner_id)
}

/// Create a task. Its lead time is always estimated in the background.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Query(owner): Query<OwnerQuery>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let new = NewTask {
        owner_id: owner.owner_id,
        title: required_str(&body, "title")?,
        description: optional_str(&body, "description"),
        due_instant: optional_instant(&body, "due_date")?,
        is_completed: optional_bool(&body, "is_completed")?.unwrap_or(false),
        color: optional_str(&body, "color"),
    };
    let item = state.db.insert_task(&new)?;
    tracing::info!("📝 Task #{} '{}' created for owner {}", item.id, item.title, item.owner_id);
    state.engine.backfill_lead_time(item.clone());
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"ok": true, "task": item_json(&item)})),
    ))
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
    Json(body): Json<Value>,
) -> ApiResult {
    let patch = TaskPatch {
        title: optional_str(&body, "title"),
        description: optional_str(&body, "description"),
        due_instant: nullable_instant(&body, "due_date")?,
        is_completed: optional_bool(&body, "is_completed")?,
        color: optional_str(&body, "color"),
    };
    let change = state.db.update_task(id, owner.owner_id, &patch)?;
    if change.rescheduled || change.deactivated {
        state.engine.invalidate(change.item.key());
    }
    // A task that just got its first due date still needs a lead time.
    state.engine.backfill_lead_time(change.item.clone());
    Ok(Json(serde_json::json!({"ok": true, "task": item_json(&change.item)})))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult {
    delete_item(&state, ItemKey::task(id), owner.owner_id)
}

fn delete_item(state: &AppState, key: ItemKey, owner_id: OwnerId) -> ApiResult {
    state.db.delete_item(key, owner_id)?;
    state.engine.invalidate(key);
    tracing::info!("🗑️ {key} deleted by owner {owner_id}");
    Ok(Json(serde_json::json!({"ok": true, "message": format!("{key} deleted")})))
}
