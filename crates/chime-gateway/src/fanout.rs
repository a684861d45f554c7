//! Session hub and notification fanout.
//!
//! Every WebSocket session registers under its owner's group (`user_<id>`).
//! The fanout serializes a notification once and pushes it to each session
//! of the owning user without waiting on any of them: a session whose
//! buffer is full misses that notification, a closed one is dropped.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chime_core::traits::NotificationSink;
use chime_core::types::{DeliveryOutcome, Notification, OwnerId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Outbound frames buffered per session before pushes start failing.
pub const SESSION_BUFFER: usize = 32;

/// Broadcast group name for one user.
pub fn group_name(owner_id: OwnerId) -> String {
    format!("user_{owner_id}")
}

/// Live sessions grouped by owner.
#[derive(Default)]
pub struct SessionHub {
    groups: RwLock<HashMap<OwnerId, HashMap<Uuid, mpsc::Sender<String>>>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session; the receiver yields frames to write to the socket.
    pub fn register(&self, owner_id: OwnerId) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session_id = Uuid::new_v4();
        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        groups.entry(owner_id).or_default().insert(session_id, tx);
        tracing::info!("🔌 Session {session_id} joined {}", group_name(owner_id));
        (session_id, rx)
    }

    pub fn unregister(&self, owner_id: OwnerId, session_id: Uuid) {
        let mut groups = self.groups.write().unwrap_or_else(|p| p.into_inner());
        if let Some(group) = groups.get_mut(&owner_id) {
            if group.remove(&session_id).is_some() {
                tracing::info!("🔌 Session {session_id} left {}", group_name(owner_id));
            }
            if group.is_empty() {
                groups.remove(&owner_id);
            }
        }
    }

    /// Sessions currently registered for `owner_id`.
    pub fn connected_sessions(&self, owner_id: OwnerId) -> Vec<Uuid> {
        let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
        groups
            .get(&owner_id)
            .map(|group| group.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
        groups.values().map(HashMap::len).sum()
    }

    /// Push one frame to every session of `owner_id`.
    /// Returns `None` when the owner has no session.
    pub fn push(&self, owner_id: OwnerId, frame: &str) -> Option<(usize, usize)> {
        let targets: Vec<(Uuid, mpsc::Sender<String>)> = {
            let groups = self.groups.read().unwrap_or_else(|p| p.into_inner());
            let group = groups.get(&owner_id)?;
            group.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };
        if targets.is_empty() {
            return None;
        }

        let mut delivered = 0;
        let mut failed = 0;
        for (session_id, tx) in targets {
            match tx.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    failed += 1;
                    tracing::warn!("⚠️ Session {session_id} is behind, notification dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    failed += 1;
                    tracing::debug!("Session {session_id} already closed, removing");
                    self.unregister(owner_id, session_id);
                }
            }
        }
        Some((delivered, failed))
    }
}

/// [`NotificationSink`] that pushes `notification` envelopes through the hub.
#[derive(Clone)]
pub struct Fanout {
    hub: Arc<SessionHub>,
}

impl Fanout {
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self { hub }
    }

    /// Wire form of a notification: `{"type":"notification","payload":{...}}`.
    pub fn envelope(notification: &Notification) -> serde_json::Result<String> {
        serde_json::to_string(&serde_json::json!({
            "type": "notification",
            "payload": notification,
        }))
    }
}

#[async_trait]
impl NotificationSink for Fanout {
    async fn deliver(&self, owner_id: OwnerId, notification: &Notification) -> DeliveryOutcome {
        let sessions = self.hub.connected_sessions(owner_id).len();
        if sessions == 0 {
            tracing::debug!("🔕 No live session in {}", group_name(owner_id));
            return DeliveryOutcome::NoRecipient;
        }

        let frame = match Self::envelope(notification) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    "❌ Could not encode notification for item {}: {e}",
                    notification.item_id
                );
                return DeliveryOutcome::Delivered { delivered: 0, failed: sessions };
            }
        };

        match self.hub.push(owner_id, &frame) {
            Some((delivered, failed)) => DeliveryOutcome::Delivered { delivered, failed },
            None => DeliveryOutcome::NoRecipient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_core::types::ItemKind;

    fn notification() -> Notification {
        Notification {
            kind: ItemKind::Task,
            item_id: 3,
            title: "Submit report".into(),
            description: Some("quarterly numbers".into()),
            due_instant: "2025-01-01T10:00:00.000Z".into(),
            lead_minutes: 30,
            extras: Default::default(),
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let hub = SessionHub::new();
        let (a, _rx_a) = hub.register(1);
        let (b, _rx_b) = hub.register(1);
        let (_c, _rx_c) = hub.register(2);
        assert_eq!(hub.session_count(), 3);
        assert_eq!(hub.connected_sessions(1).len(), 2);

        hub.unregister(1, a);
        hub.unregister(1, b);
        assert!(hub.connected_sessions(1).is_empty());
        assert_eq!(hub.session_count(), 1);
        assert_eq!(group_name(7), "user_7");
    }

    #[tokio::test]
    async fn test_no_session_is_no_recipient() {
        let hub = Arc::new(SessionHub::new());
        let (_id, _rx) = hub.register(2);
        let fanout = Fanout::new(hub);
        assert_eq!(fanout.deliver(1, &notification()).await, DeliveryOutcome::NoRecipient);
    }

    #[tokio::test]
    async fn test_delivers_to_every_session_of_owner() {
        let hub = Arc::new(SessionHub::new());
        let (_a, mut rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(1);
        let (_c, mut rx_other) = hub.register(2);
        let fanout = Fanout::new(hub);

        let outcome = fanout.deliver(1, &notification()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { delivered: 2, failed: 0 });

        for rx in [&mut rx_a, &mut rx_b] {
            let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "notification");
            assert_eq!(frame["payload"]["type"], "task");
            assert_eq!(frame["payload"]["title"], "Submit report");
            assert_eq!(frame["payload"]["due_instant"], "2025-01-01T10:00:00.000Z");
        }
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_session_does_not_affect_others() {
        let hub = Arc::new(SessionHub::new());
        let (_a, rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(1);
        drop(rx_a);
        let fanout = Fanout::new(hub.clone());

        let outcome = fanout.deliver(1, &notification()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { delivered: 1, failed: 1 });
        assert!(rx_b.recv().await.is_some());
        assert_eq!(hub.connected_sessions(1).len(), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let hub = Arc::new(SessionHub::new());
        let (_a, _rx_slow) = hub.register(1);
        for _ in 0..SESSION_BUFFER {
            hub.push(1, "{}");
        }
        let fanout = Fanout::new(hub.clone());
        let outcome = fanout.deliver(1, &notification()).await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { delivered: 0, failed: 1 });
        assert!(!outcome.reached_anyone());
        assert_eq!(hub.connected_sessions(1).len(), 1);
    }
}
