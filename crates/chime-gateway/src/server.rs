//! HTTP server implementation using Axum.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post, put},
};
use chime_core::config::GatewayConfig;
use chime_scheduler::{ReminderDb, ReminderEngine};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::fanout::SessionHub;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Reminder store (events and tasks).
    pub db: ReminderDb,
    /// Scanner handle, used to invalidate delivery state and backfill lead times.
    pub engine: ReminderEngine,
    /// Live WebSocket sessions grouped by owner.
    pub hub: Arc<SessionHub>,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        db: ReminderDb,
        engine: ReminderEngine,
        hub: Arc<SessionHub>,
    ) -> Self {
        Self {
            gateway_config,
            start_time: std::time::Instant::now(),
            db,
            engine,
            hub,
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("⚠️ Ignoring invalid CORS origin '{o}'");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let cors = cors_layer(&shared.gateway_config.cors_origins);

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/ws", get(super::ws::ws_handler))
        .route("/api/v1/items", get(super::routes::list_items))
        .route("/api/v1/notifications", get(super::routes::list_notifications))
        .route("/api/v1/events", post(super::routes::create_event))
        .route(
            "/api/v1/events/{id}",
            put(super::routes::update_event).delete(super::routes::delete_event),
        )
        .route("/api/v1/tasks", post(super::routes::create_task))
        .route(
            "/api/v1/tasks/{id}",
            put(super::routes::update_task).delete(super::routes::delete_task),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` resolves. Open WebSocket sessions are closed
/// when the server stops.
pub async fn start(
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state);
    tracing::info!("🌐 Gateway listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chime_core::config::{EstimatorConfig, SchedulerConfig};
    use chime_core::types::ItemKey;
    use chime_providers::FixedEstimator;
    use futures::{SinkExt, StreamExt};
    use tower::ServiceExt;

    use crate::fanout::Fanout;

    fn test_state() -> AppState {
        let db = ReminderDb::open_in_memory().unwrap();
        let hub = Arc::new(SessionHub::new());
        let engine = ReminderEngine::new(
            Arc::new(db.clone()),
            Arc::new(FixedEstimator::new(EstimatorConfig::default())),
            Arc::new(Fanout::new(hub.clone())),
            SchedulerConfig::default(),
        );
        AppState::new(GatewayConfig::default(), db, engine, hub)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(test_state());
        let (status, json) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["sessions"], 0);
        assert_eq!(json["tracked_reminders"], 0);
    }

    #[tokio::test]
    async fn test_create_event_normalizes_and_keeps_user_lead() {
        let app = build_router(test_state());
        let (status, json) = call(
            &app,
            "POST",
            "/api/v1/events?owner_id=1",
            Some(serde_json::json!({
                "title": "Standup",
                "start_time": "2030-01-01T12:00:00+02:00",
                "end_time": "2030-01-01T10:30:00",
                "reminder": 5,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["event"]["start_time"], "2030-01-01T10:00:00.000Z");
        assert_eq!(json["event"]["end_time"], "2030-01-01T10:30:00.000Z");
        assert_eq!(json["event"]["reminder"], 5);
        assert_eq!(json["event"]["color"], "blue");
    }

    #[tokio::test]
    async fn test_malformed_timestamp_is_400() {
        let app = build_router(test_state());
        let (status, json) = call(
            &app,
            "POST",
            "/api/v1/events?owner_id=1",
            Some(serde_json::json!({
                "title": "Standup",
                "start_time": "next tuesday",
                "end_time": "2030-01-01T10:30:00Z",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["ok"], false);
        assert!(json["error"].as_str().unwrap().contains("next tuesday"));
    }

    #[tokio::test]
    async fn test_non_string_due_date_is_400() {
        let state = test_state();
        let app = build_router(state.clone());
        let (status, json) = call(
            &app,
            "POST",
            "/api/v1/tasks?owner_id=1",
            Some(serde_json::json!({"title": "Pay rent", "due_date": 1735725600})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("1735725600"));
        assert!(state.db.list_items_for_owner(1).unwrap().is_empty());

        let (_, json) = call(
            &app,
            "POST",
            "/api/v1/events?owner_id=1",
            Some(serde_json::json!({
                "title": "Standup",
                "start_time": "2030-01-01T10:00:00Z",
                "end_time": "2030-01-01T10:30:00Z",
            })),
        )
        .await;
        let id = json["event"]["id"].as_i64().unwrap();
        let (status, _) = call(
            &app,
            "PUT",
            &format!("/api/v1/events/{id}?owner_id=1"),
            Some(serde_json::json!({"start_time": {"hour": 9}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let state = test_state();
        let app = build_router(state.clone());

        let (status, json) = call(
            &app,
            "POST",
            "/api/v1/tasks?owner_id=1",
            Some(serde_json::json!({
                "title": "Submit report",
                "description": "submit report",
                "due_date": "2030-01-01T10:00:00Z",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["task"]["id"].as_i64().unwrap();
        assert_eq!(json["task"]["color"], "green");

        // Background backfill settles on the configured task default.
        let key = ItemKey::task(id);
        for _ in 0..100 {
            if state.db.get_item(key).unwrap().unwrap().lead_minutes.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state.db.get_item(key).unwrap().unwrap().lead_minutes, Some(30));

        let uri = format!("/api/v1/tasks/{id}?owner_id=1");
        let body = serde_json::json!({"is_completed": true});
        let (status, json) = call(&app, "PUT", &uri, Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["task"]["is_completed"], true);

        let other = format!("/api/v1/tasks/{id}?owner_id=2");
        let (status, _) = call(&app, "PUT", &other, Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = call(&app, "GET", "/api/v1/items?owner_id=1", None).await;
        assert_eq!(json["items"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reschedule_clears_delivery_state() {
        let state = test_state();
        let app = build_router(state.clone());
        let (_, json) = call(
            &app,
            "POST",
            "/api/v1/tasks?owner_id=1",
            Some(serde_json::json!({"title": "Pay rent", "due_date": "2030-01-01T10:00:00Z"})),
        )
        .await;
        let id = json["task"]["id"].as_i64().unwrap();
        let key = ItemKey::task(id);
        let due = chime_core::time::normalize("2030-01-01T10:00:00Z").unwrap();
        assert!(state.engine.tracker().try_claim(key, due));

        call(
            &app,
            "PUT",
            &format!("/api/v1/tasks/{id}?owner_id=1"),
            Some(serde_json::json!({"due_date": "2030-01-02T10:00:00Z"})),
        )
        .await;
        assert!(state.engine.tracker().record(key).is_none());
    }

    #[tokio::test]
    async fn test_websocket_session_receives_notifications() {
        let state = test_state();
        let hub = state.hub.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, state, async {
            let _ = stop_rx.await;
        }));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?owner_id=7"))
            .await
            .unwrap();
        let next_json = |msg: tokio_tungstenite::tungstenite::Message| -> serde_json::Value {
            serde_json::from_str(msg.to_text().unwrap()).unwrap()
        };

        let hello = next_json(ws.next().await.unwrap().unwrap());
        assert_eq!(hello["type"], "connected");
        assert_eq!(hello["group"], "user_7");
        assert_eq!(hub.connected_sessions(7).len(), 1);

        ws.send(tokio_tungstenite::tungstenite::Message::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(ws.next().await.unwrap().unwrap())["type"], "pong");

        assert_eq!(hub.push(7, r#"{"type":"notification","payload":{}}"#), Some((1, 0)));
        assert_eq!(next_json(ws.next().await.unwrap().unwrap())["type"], "notification");

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if hub.session_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(hub.session_count(), 0);

        let _ = stop_tx.send(());
        server.await.unwrap().unwrap();
    }
}
