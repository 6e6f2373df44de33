use serde::{Deserialize, Serialize};

use crate::db::Store;
use crate::error::StoreResult;
use crate::params;
use crate::value::Row;

/// One dispatched (or dry-run) notification. Append-only apart from `clicked_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationLogEntry {
    pub id: String,
    /// `None` for broadcasts.
    pub user_id: Option<String>,
    pub notification_type: String,
    pub related_symbols: Vec<String>,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub sent_at: String,
    pub clicked_at: Option<String>,
    pub channel: String,
}

fn log_from_row(row: &Row) -> StoreResult<NotificationLogEntry> {
    Ok(NotificationLogEntry {
        id: row.text("id")?,
        user_id: row.opt_text("user_id"),
        notification_type: row.text("type")?,
        related_symbols: row
            .json("related_symbols")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        title: row.text("title")?,
        body: row.text("body")?,
        url: row.opt_text("url"),
        sent_at: row.text("sent_at")?,
        clicked_at: row.opt_text("clicked_at"),
        channel: row.opt_text("channel").unwrap_or_else(|| "push".into()),
    })
}

impl Store {
    pub async fn insert_notification_log(&self, entry: &NotificationLogEntry) -> StoreResult<()> {
        self.execute(
            "INSERT INTO notification_logs
                (id, user_id, type, related_symbols, title, body, url, sent_at, clicked_at, channel)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &params![
                &entry.id,
                entry.user_id.as_deref(),
                &entry.notification_type,
                serde_json::to_string(&entry.related_symbols)?,
                &entry.title,
                &entry.body,
                entry.url.as_deref(),
                &entry.sent_at,
                entry.clicked_at.as_deref(),
                &entry.channel,
            ],
        )
        .await?;
        Ok(())
    }

    /// Record the first click on a tracked notification.
    pub async fn mark_notification_clicked(&self, id: &str) -> StoreResult<bool> {
        let result = self
            .execute(
                "UPDATE notification_logs SET clicked_at = ? WHERE id = ? AND clicked_at IS NULL",
                &params![self.now(), id],
            )
            .await?;
        Ok(result.rows_affected > 0)
    }

    pub async fn notification_logs_for(&self, user_id: &str) -> StoreResult<Vec<NotificationLogEntry>> {
        self.query(
            "SELECT * FROM notification_logs WHERE user_id = ? ORDER BY sent_at, rowid",
            &params![user_id],
        )
        .await?
        .iter()
        .map(log_from_row)
        .collect()
    }

    pub async fn count_notifications(&self, user_id: &str, notification_type: &str) -> StoreResult<i64> {
        Ok(self
            .query_row(
                "SELECT COUNT(*) AS n FROM notification_logs WHERE user_id = ? AND type = ?",
                &params![user_id, notification_type],
            )
            .await?
            .and_then(|r| r.opt_integer("n"))
            .unwrap_or(0))
    }

    pub async fn count_all_notifications(&self) -> StoreResult<i64> {
        Ok(self
            .query_row("SELECT COUNT(*) AS n FROM notification_logs", &[])
            .await?
            .and_then(|r| r.opt_integer("n"))
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::user;

    #[tokio::test]
    async fn log_and_click() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_user(&user("u1", "free")).await.unwrap();
        let entry = NotificationLogEntry {
            id: "notif_abc123def456".into(),
            user_id: Some("u1".into()),
            notification_type: "signal_flip".into(),
            related_symbols: vec!["00700".into()],
            title: "t".into(),
            body: "b".into(),
            url: Some("https://app/x?nid=notif_abc123def456".into()),
            sent_at: "2026-01-02 18:00:00".into(),
            clicked_at: None,
            channel: "push".into(),
        };
        store.insert_notification_log(&entry).await.unwrap();

        // Broadcasts carry no user.
        let mut broadcast = entry.clone();
        broadcast.id = "notif_broadcast01".into();
        broadcast.user_id = None;
        broadcast.notification_type = "price_update".into();
        store.insert_notification_log(&broadcast).await.unwrap();

        assert!(store.mark_notification_clicked(&entry.id).await.unwrap());
        assert!(!store.mark_notification_clicked(&entry.id).await.unwrap());

        let logs = store.notification_logs_for("u1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].clicked_at.is_some());
        assert_eq!(logs[0].related_symbols, vec!["00700"]);
        assert_eq!(store.count_notifications("u1", "signal_flip").await.unwrap(), 1);
        assert_eq!(store.count_all_notifications().await.unwrap(), 2);
    }
}
