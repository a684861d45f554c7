//! # Chime Gateway
//!
//! HTTP + WebSocket surface of the reminder service, and the notification
//! fanout the scanner hands fired reminders to.
//!
//! ```text
//! GET  /ws?owner_id=<id>        → session joins group user_<id>
//! POST/PUT/DELETE /api/v1/events[/{id}]
//! POST/PUT/DELETE /api/v1/tasks[/{id}]
//! GET  /api/v1/items?owner_id=  → events + tasks of one owner
//! GET  /api/v1/notifications    → recently fired reminders
//! GET  /health
//! ```

pub mod fanout;
pub mod routes;
pub mod server;
pub mod ws;

pub use fanout::{Fanout, SessionHub, group_name};
pub use server::{AppState, build_router, serve, start};
