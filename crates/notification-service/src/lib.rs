//! Per-user notification bus: durable store plus live fan-out.
//!
//! Every event is persisted before it is broadcast, so a subscriber that
//! lags (or is offline) can always recover by listing the store. Live
//! delivery is at-most-once per connected subscriber; the broadcast
//! channel drops events for receivers that cannot keep up.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use market_core::StoreError;
use market_store::{MarketStore, NotificationPage, NotificationRow};

/// Capacity of each per-user live channel. Slow subscribers past this
/// lose live events, never stored ones.
const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Analysis,
    Alert,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Analysis => "analysis",
            NotificationKind::Alert => "alert",
            NotificationKind::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

/// The live wire shape pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub severity: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

pub struct NotificationBus {
    store: MarketStore,
    channels: DashMap<String, broadcast::Sender<NotificationEvent>>,
}

impl NotificationBus {
    pub fn new(store: MarketStore) -> Self {
        Self {
            store,
            channels: DashMap::new(),
        }
    }

    /// Persist, then broadcast to live subscribers. Returns the stored id.
    pub async fn publish(
        &self,
        user_id: &str,
        kind: NotificationKind,
        severity: Severity,
        title: &str,
        content: Option<String>,
        link: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<String, StoreError> {
        let row = NotificationRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: kind.as_str().to_string(),
            title: title.to_string(),
            content,
            link,
            severity: severity.as_str().to_string(),
            status: "unread".to_string(),
            created_at: Utc::now(),
            metadata,
        };
        self.store.insert_notification(&row).await?;

        let event = NotificationEvent {
            id: row.id.clone(),
            kind: row.kind.clone(),
            title: row.title.clone(),
            content: row.content.clone(),
            link: row.link.clone(),
            severity: row.severity.clone(),
            status: row.status.clone(),
            created_at: row.created_at,
        };
        if let Some(sender) = self.channels.get(user_id) {
            // A send error only means nobody is connected right now.
            let delivered = sender.send(event).is_ok();
            tracing::debug!(user = user_id, title, delivered, "notification published");
        }
        Ok(row.id)
    }

    /// Live subscription for one user. The receiver sees events published
    /// after this call; history comes from `list`.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<NotificationEvent> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub async fn list(
        &self,
        user_id: &str,
        status: Option<&str>,
        kind: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<NotificationPage, StoreError> {
        self.store
            .list_notifications(user_id, status, kind, page, page_size)
            .await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<i64, StoreError> {
        self.store.unread_notification_count(user_id).await
    }

    pub async fn mark_read(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        self.store.mark_notification_read(user_id, id).await
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<i64, StoreError> {
        self.store.mark_all_notifications_read(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bus() -> NotificationBus {
        let store = MarketStore::new("sqlite::memory:").await.unwrap();
        NotificationBus::new(store)
    }

    #[tokio::test]
    async fn publish_persists_then_broadcasts() {
        let bus = bus().await;
        let mut rx = bus.subscribe("u1");

        let id = bus
            .publish(
                "u1",
                NotificationKind::Analysis,
                Severity::Info,
                "task completed",
                Some("600000 analysis finished".to_string()),
                None,
                None,
            )
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.kind, "analysis");
        assert_eq!(event.status, "unread");

        // Durable copy exists regardless of live delivery.
        let page = bus.list("u1", None, None, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, id);
    }

    #[tokio::test]
    async fn publish_without_subscribers_still_persists() {
        let bus = bus().await;
        bus.publish(
            "u1",
            NotificationKind::System,
            Severity::Warn,
            "provider degraded",
            None,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(bus.unread_count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn events_are_isolated_per_user() {
        let bus = bus().await;
        let mut rx_other = bus.subscribe("u2");
        bus.publish(
            "u1",
            NotificationKind::Alert,
            Severity::Error,
            "only for u1",
            None,
            None,
            None,
        )
        .await
        .unwrap();

        assert!(matches!(
            rx_other.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(bus.unread_count("u2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn per_user_delivery_preserves_created_at_order() {
        let bus = bus().await;
        let mut rx = bus.subscribe("u1");
        for i in 0..5 {
            bus.publish(
                "u1",
                NotificationKind::Analysis,
                Severity::Info,
                &format!("event {i}"),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        }
        let mut last = None;
        for _ in 0..5 {
            let event = rx.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(event.created_at >= prev);
            }
            last = Some(event.created_at);
        }
    }
}
