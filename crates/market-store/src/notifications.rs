//! `notifications` collection: per-user durable notification store.
//!
//! Retention runs on every write: rows older than 90 days go first, then
//! anything past the newest 1000 per user.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::Row;

use market_core::StoreError;

use crate::{map_sqlx, ts_from_col, ts_to_col, MarketStore};

pub const RETAIN_DAYS: i64 = 90;
pub const MAX_PER_USER: i64 = 1000;

/// One persisted notification row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub content: Option<String>,
    pub link: Option<String>,
    pub severity: String,
    pub status: String,
    pub created_at: chrono::DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NotificationPage {
    pub items: Vec<NotificationRow>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl MarketStore {
    pub async fn insert_notification(&self, row: &NotificationRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications \
             (id, user_id, kind, title, content, link, severity, status, created_at, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.kind)
        .bind(&row.title)
        .bind(&row.content)
        .bind(&row.link)
        .bind(&row.severity)
        .bind(&row.status)
        .bind(ts_to_col(row.created_at))
        .bind(row.metadata.as_ref().map(|m| m.to_string()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        self.prune_notifications(&row.user_id).await
    }

    async fn prune_notifications(&self, user_id: &str) -> Result<(), StoreError> {
        let cutoff = ts_to_col(Utc::now() - ChronoDuration::days(RETAIN_DAYS));
        sqlx::query("DELETE FROM notifications WHERE user_id = ? AND created_at < ?")
            .bind(user_id)
            .bind(&cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;

        sqlx::query(
            "DELETE FROM notifications WHERE user_id = ? AND id NOT IN \
             (SELECT id FROM notifications WHERE user_id = ? \
              ORDER BY created_at DESC LIMIT ?)",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(MAX_PER_USER)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn list_notifications(
        &self,
        user_id: &str,
        status: Option<&str>,
        kind: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<NotificationPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;

        let mut where_clause = "user_id = ?".to_string();
        if status.is_some() {
            where_clause.push_str(" AND status = ?");
        }
        if kind.is_some() {
            where_clause.push_str(" AND kind = ?");
        }

        let count_sql = format!("SELECT COUNT(*) AS n FROM notifications WHERE {where_clause}");
        let mut count_query = sqlx::query(&count_sql).bind(user_id);
        if let Some(status) = status {
            count_query = count_query.bind(status);
        }
        if let Some(kind) = kind {
            count_query = count_query.bind(kind);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?
            .get("n");

        let list_sql = format!(
            "SELECT * FROM notifications WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        let mut list_query = sqlx::query(&list_sql).bind(user_id);
        if let Some(status) = status {
            list_query = list_query.bind(status);
        }
        if let Some(kind) = kind {
            list_query = list_query.bind(kind);
        }
        let rows = list_query
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(NotificationPage {
            items: rows.iter().map(row_to_notification).collect(),
            total,
            page,
            page_size,
        })
    }

    pub async fn unread_notification_count(&self, user_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM notifications WHERE user_id = ? AND status = 'unread'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.get("n"))
    }

    pub async fn mark_notification_read(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'read' WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_all_notifications_read(&self, user_id: &str) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'read' WHERE user_id = ? AND status = 'unread'",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() as i64)
    }
}

fn row_to_notification(row: &sqlx::sqlite::SqliteRow) -> NotificationRow {
    NotificationRow {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: row.get("kind"),
        title: row.get("title"),
        content: row.get("content"),
        link: row.get("link"),
        severity: row.get("severity"),
        status: row.get("status"),
        created_at: ts_from_col(row.get::<String, _>("created_at").as_str())
            .unwrap_or_else(Utc::now),
        metadata: row
            .get::<Option<String>, _>("metadata")
            .and_then(|s| serde_json::from_str(&s).ok()),
    }
}
